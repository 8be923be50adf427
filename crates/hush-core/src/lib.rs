//! hush-core
//!
//! Optimistic "silent" request queue: submissions answer at once with
//! virtual data, run in the background per named queue, and replace the
//! virtual data with the real response everywhere it was captured.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, behavior, method descriptor, events）
//! - **vdata**: virtual data（placeholder, 式ツリー, token, registry, state cell）
//! - **queue**: タスクレコード、リトライポリシー、永続化されるキューストア
//! - **ports**: 抽象化レイヤー（Transport, Storage, StateSink, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStorage, FileStorage, MemoryStates, FnTransport）
//! - **app**: SilentFactory, drain loop, hook, middleware, delegation
//! - **config** / **error** / **observability**

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod vdata;

pub use app::{BuildError, FactoryStatus, HushBuilder, SilentFactory, SqHook, SqRequest};
pub use config::HushConfig;
pub use error::{HushError, TransportFailure};
