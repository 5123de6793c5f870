//! Zero-copy tensor sharing between processes
//!
//! A store daemon owns an arena of shared-memory segments and an index from
//! object identifiers to segments. Clients write tensor buffers into the
//! store once and every process that asks for the identifier maps the same
//! bytes: in-place writes through one view are visible through all others.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │      process A       │        │      process B       │
//! │  Tensor ─► encode    │ stdin  │  decode ─► Tensor    │
//! │  ForkingCodec ───────┼───────►│  ForkingCodec        │
//! │  TransportHook       │ refs   │  TransportHook       │
//! │  StoreClient         │        │  StoreClient         │
//! └────┬────────────┬────┘        └────┬────────────┬────┘
//!      │ requests   │ mmap             │ requests   │ mmap
//! ┌────▼────────────┼──────────────────▼────┐       │
//! │  warp-shmd      │                       │       │
//! │  StoreServer ── ObjectTable (index)     │       │
//! └─────────────────┼───────────────────────┘       │
//!              ┌────▼───────────────────────────────▼──┐
//!              │  arena: seg-0000000000000000 ...      │
//!              └───────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use warp_shm::{ClientConfig, ObjectId, PutOptions, StoreClient, Tensor};
//!
//! # fn main() -> warp_shm::ShmResult<()> {
//! let client = StoreClient::connect(ClientConfig::from_env())?;
//! let id = ObjectId::new("test111")?;
//! let a = Tensor::from_vec(&[2, 3], vec![1i64, 2, 3, 5, 4, 6])?;
//! client.put_tensor(&id, &a, PutOptions::default())?;
//!
//! // any process connected to the same store
//! let mut view = client.get_tensor(&id)?;
//! view.set(&[0, 0], 999i64)?;
//! assert_eq!(client.get_tensor(&id)?.get::<i64>(&[0, 0])?, 999);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod device;
pub mod dlpack;
pub mod dtype;
pub mod error;
pub mod id;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod segment;
pub mod server;
pub mod spawn;
pub mod tensor;
pub mod transport;

pub use client::{PutOptions, StoreClient};
pub use config::{ClientConfig, StoreConfig};
pub use device::{Device, DeviceKind};
pub use dlpack::{DLDataType, DLDevice, DLTensor, DlpackExport, DlpackTensor};
pub use dtype::{DataType, DataTypeCode, Element};
pub use error::{ShmError, ShmResult};
pub use id::{generate_identifier, IdGenerator, ObjectId};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use protocol::StoreStats;
pub use registry::ClientRegistry;
pub use segment::{SegmentInfo, SharedRegion};
pub use server::{spawn_background, BackgroundStore, ObjectTable, StoreServer};
pub use spawn::{read_worker_args, spawn_worker, Worker};
pub use tensor::{Tensor, TensorMeta, TensorSource};
pub use transport::{ForkingCodec, Registration, TensorRef, TransportHook};
