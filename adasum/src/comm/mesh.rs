use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::comm::{Communicator, check_peer, checked_len};
use crate::error::{AdasumError, Result};
use crate::types::{DataType, Rank, Tag};

struct Envelope {
    tag: Tag,
    payload: Vec<u8>,
}

/// In-process communicator endpoint.
///
/// Every ordered pair of ranks has its own unbounded channel, so sends never
/// block and FIFO order per `(src, dst)` comes for free. A receive that pulls
/// a message with a different tag parks it in the stash until a matching
/// `recv` asks for it.
///
/// Blocking receives drive the channel future on a runtime owned by the
/// endpoint, bounded by the configured timeout.
pub struct MeshComm {
    rank: Rank,
    size: u32,
    /// Indexed by destination rank.
    outboxes: Vec<mpsc::UnboundedSender<Envelope>>,
    /// Indexed by source rank.
    inboxes: Vec<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    stash: Mutex<HashMap<(Rank, Tag), VecDeque<Vec<u8>>>>,
    timeout: Duration,
    rt: tokio::runtime::Runtime,
}

impl MeshComm {
    /// Build a fully connected group of `size` endpoints; element `r` is rank `r`.
    pub fn group(size: u32, timeout: Duration) -> Result<Vec<Arc<MeshComm>>> {
        let n = size as usize;
        let mut outboxes: Vec<Vec<mpsc::UnboundedSender<Envelope>>> =
            (0..n).map(|_| Vec::with_capacity(n)).collect();
        let mut inboxes: Vec<Vec<Mutex<mpsc::UnboundedReceiver<Envelope>>>> =
            (0..n).map(|_| Vec::with_capacity(n)).collect();

        // Destination-major so `outboxes[src]` ends up indexed by destination.
        for dst in 0..n {
            for src_outboxes in outboxes.iter_mut() {
                let (tx, rx) = mpsc::unbounded_channel();
                src_outboxes.push(tx);
                inboxes[dst].push(Mutex::new(rx));
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .map_err(|e| {
                        AdasumError::transport("runtime", rank as Rank, format!("tokio: {e}"))
                    })?;
                Ok(Arc::new(MeshComm {
                    rank: rank as Rank,
                    size,
                    outboxes,
                    inboxes,
                    stash: Mutex::new(HashMap::new()),
                    timeout,
                    rt,
                }))
            })
            .collect()
    }

    fn take_stashed(&self, src: Rank, tag: Tag) -> Option<Vec<u8>> {
        let mut stash = self.stash.lock();
        let queue = stash.get_mut(&(src, tag))?;
        let msg = queue.pop_front();
        if queue.is_empty() {
            stash.remove(&(src, tag));
        }
        msg
    }

    fn next_message(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        // Stashing happens under the inbox lock, so checking after taking it
        // cannot miss a message parked by a concurrent receiver.
        let mut inbox = self.inboxes[src as usize].lock();
        if let Some(msg) = self.take_stashed(src, tag) {
            return Ok(msg);
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let next = self
                .rt
                .block_on(async { tokio::time::timeout_at(deadline, inbox.recv()).await });
            match next {
                Ok(Some(env)) if env.tag == tag => return Ok(env.payload),
                Ok(Some(env)) => {
                    self.stash
                        .lock()
                        .entry((src, env.tag))
                        .or_default()
                        .push_back(env.payload);
                }
                Ok(None) => {
                    return Err(AdasumError::transport("recv", src, "peer endpoint closed"));
                }
                Err(_) => {
                    tracing::warn!(
                        rank = self.rank,
                        src,
                        tag,
                        timeout_secs = self.timeout.as_secs(),
                        "receive timed out"
                    );
                    return Err(AdasumError::transport(
                        "recv",
                        src,
                        format!("timed out after {}s", self.timeout.as_secs()),
                    ));
                }
            }
        }
    }
}

impl Communicator for MeshComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send(&self, buf: &[u8], count: usize, dtype: DataType, dest: Rank, tag: Tag) -> Result<()> {
        check_peer(dest, self.size)?;
        let len = checked_len(buf.len(), count, dtype)?;
        self.outboxes[dest as usize]
            .send(Envelope {
                tag,
                payload: buf[..len].to_vec(),
            })
            .map_err(|_| AdasumError::transport("send", dest, "peer endpoint closed"))
    }

    fn recv(
        &self,
        buf: &mut [u8],
        count: usize,
        dtype: DataType,
        src: Rank,
        tag: Tag,
    ) -> Result<()> {
        check_peer(src, self.size)?;
        let len = checked_len(buf.len(), count, dtype)?;
        let payload = self.next_message(src, tag)?;
        if payload.len() != len {
            return Err(AdasumError::BufferSizeMismatch {
                expected: len,
                actual: payload.len(),
            });
        }
        buf[..len].copy_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    #[test]
    fn test_send_recv_pair() {
        let comms = MeshComm::group(2, Duration::from_secs(5)).unwrap();
        let data = f32_bytes(&[1.0, 2.0, 3.0]);
        comms[0].send(&data, 3, DataType::F32, 1, 7).unwrap();

        let mut out = vec![0u8; 12];
        comms[1].recv(&mut out, 3, DataType::F32, 0, 7).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_out_of_order_tags_are_stashed() {
        let comms = MeshComm::group(2, Duration::from_secs(5)).unwrap();
        comms[0].send(&[1], 1, DataType::U8, 1, 10).unwrap();
        comms[0].send(&[2], 1, DataType::U8, 1, 20).unwrap();
        comms[0].send(&[3], 1, DataType::U8, 1, 10).unwrap();

        let mut b = [0u8; 1];
        comms[1].recv(&mut b, 1, DataType::U8, 0, 20).unwrap();
        assert_eq!(b[0], 2);
        comms[1].recv(&mut b, 1, DataType::U8, 0, 10).unwrap();
        assert_eq!(b[0], 1);
        comms[1].recv(&mut b, 1, DataType::U8, 0, 10).unwrap();
        assert_eq!(b[0], 3);
    }

    #[test]
    fn test_threads_exchange() {
        let comms = MeshComm::group(2, Duration::from_secs(5)).unwrap();
        std::thread::scope(|s| {
            for comm in &comms {
                s.spawn(move || {
                    let peer = 1 - comm.rank();
                    let mine = [comm.rank() as u8; 4];
                    let mut theirs = [0u8; 4];
                    comm.send_recv(&mine, 4, peer, &mut theirs, 4, peer, DataType::U8, 0)
                        .unwrap();
                    assert_eq!(theirs, [peer as u8; 4]);
                });
            }
        });
    }

    #[test]
    fn test_recv_timeout_is_transport_error() {
        let comms = MeshComm::group(2, Duration::from_millis(20)).unwrap();
        let mut b = [0u8; 4];
        let err = comms[1].recv(&mut b, 1, DataType::F32, 0, 0).unwrap_err();
        assert!(matches!(err, AdasumError::Transport { rank: 0, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_length_mismatch() {
        let comms = MeshComm::group(2, Duration::from_secs(5)).unwrap();
        comms[0].send(&[0u8; 8], 2, DataType::F32, 1, 0).unwrap();
        let mut b = [0u8; 12];
        let err = comms[1].recv(&mut b, 3, DataType::F32, 0, 0).unwrap_err();
        assert!(matches!(
            err,
            AdasumError::BufferSizeMismatch {
                expected: 12,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_invalid_peer() {
        let comms = MeshComm::group(2, Duration::from_secs(5)).unwrap();
        let err = comms[0].send(&[0u8; 4], 1, DataType::F32, 2, 0).unwrap_err();
        assert!(matches!(err, AdasumError::InvalidRank { rank: 2, size: 2 }));
    }
}
