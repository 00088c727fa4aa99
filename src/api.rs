pub mod memory; // テスト・デモ用インメモリバックエンド
pub mod realtime; // Phoenixチャンネル経由のリアルタイム購読
pub mod remote; // バックエンド境界トレイト
pub mod rest; // PostgREST/RPCクライアント
pub mod subscription;

pub use memory::{CallCounts, FailurePlan, InMemoryBackend};
pub use realtime::{RealtimeConfig, RealtimeConnector};
pub use remote::{RemoteError, RemoteStateClient};
pub use rest::{BackendEndpoint, SupabaseRestClient};
pub use subscription::{RealtimeEvent, Subscription, SubscriptionFeed};
