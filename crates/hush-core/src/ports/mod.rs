//! Ports - 抽象化レイヤー
//!
//! 外部の協調者（transport、storage、UI の state コンテナ）への
//! インターフェースを trait で定義します。実装は `impls` にあります。

pub mod clock;
pub mod id_generator;
pub mod state_sink;
pub mod storage;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::state_sink::{StateSink, StateUpdate, StateView};
pub use self::storage::Storage;
pub use self::transport::Transport;
