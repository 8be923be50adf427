//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStorage**: テスト用のストレージ（スナップショットでリロードを再現）
//! - **FileStorage**: ディレクトリに 1 キー 1 ファイル
//! - **MemoryStates**: キーごとの最新 state を保持する StateSink
//! - **FnTransport**: クロージャで応答する Transport（呼び出し履歴付き）

pub mod file_storage;
pub mod fn_transport;
pub mod memory_states;
pub mod memory_storage;

pub use self::file_storage::FileStorage;
pub use self::fn_transport::FnTransport;
pub use self::memory_states::MemoryStates;
pub use self::memory_storage::InMemoryStorage;
