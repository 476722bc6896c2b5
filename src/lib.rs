pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod models;
pub mod notify;
pub mod rates;
pub mod reconcile;
pub mod store;
pub mod subscription;
pub mod sweeper;

pub use catalog::{Plan, PlanCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::SubscriptionEngine;
pub use error::{EngineError, EngineResult};
pub use models::{
    IntentStatus, LedgerEntry, LedgerKind, PaymentIntent, PaymentMethod, Subscription,
    SubscriptionStatus,
};
pub use notify::{ChannelNotifier, LogNotifier, NotificationEvent, NotificationKind, Notifier};
pub use rates::CurrencyConverter;
pub use reconcile::{
    start_reconciliation_worker, ConfirmationEvent, ConfirmationStatus, ReconciliationHandle,
};
pub use store::{MemoryStore, PgStore, Store};
