pub mod cluster;
pub mod comm;
pub mod config;
pub mod device;
pub mod entry;
pub mod error;
pub mod hierarchical;
pub mod kernels;
pub mod multi_layer;
pub mod resources;
pub mod ring;
pub mod topology;
pub mod tree;
pub mod types;

pub use cluster::{LocalCluster, RankContext};
pub use comm::{Communicator, Controller, MeshComm, MeshController, NodeComms, Scope};
pub use config::{AdasumAlgorithm, AdasumConfig};
pub use device::{DeviceRuntime, HostRuntime};
pub use entry::{Entry, Response};
pub use error::{AdasumError, Result};
pub use hierarchical::{AdasumOp, IntraNodeStrategy};
pub use kernels::{PairStats, adasum_coefficient, pairwise_adasum};
pub use multi_layer::{LayerDescriptor, MultiLayerOp};
pub use resources::{ResourceManager, ResourceStats, TempBufferPool};
pub use topology::{NodeTopology, discover_local_topology, discover_topology};
pub use tree::{TreePass, TreeSchedule, tree_allreduce, tree_broadcast, tree_reduce};
pub use types::{CPU_DEVICE_ID, ContextId, DataType, DeviceId, Rank, StreamSet, Tag};
