//! App - アプリケーション層
//!
//! ports と vdata / queue を組み合わせて silent queue を実装します。
//!
//! # 主要コンポーネント
//! - **HushBuilder**: SilentFactory の構築とワイヤリング
//! - **SilentFactory**: 状態遷移、解決の伝播、タスクの参照と操作
//! - **worker_loop**: キューごとの drain（先頭実行→リトライ→解決→削除）
//! - **SqRequest / SqHook**: static / queue / silent の送信口
//! - **Middleware / ActionDelegation**: 実行ステップのラップと名前付き委譲
//! - **Listeners / VetoListeners**: hook 単位のイベント購読

pub mod builder;
pub(crate) mod context;
pub mod delegation;
pub mod hook;
pub mod listeners;
pub mod middleware;
pub mod scheduler;
pub mod status;
pub(crate) mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, HushBuilder};
pub use self::delegation::{ActionDelegation, ActionHandlers, DelegationRegistry};
pub use self::hook::{SqHook, SqRequest};
pub use self::listeners::{HookEvents, ListenerId, Listeners, VetoListeners};
pub use self::middleware::{FnMiddleware, Middleware, MiddlewareContext, Next, middleware_fn};
pub use self::scheduler::SilentFactory;
pub use self::status::FactoryStatus;
