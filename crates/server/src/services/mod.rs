//! Business services.
//!
//! Each service receives its collaborators through `new`; none reach for
//! globals, so tests wire them to in-memory fakes.

pub mod checkout;
pub mod notify;
pub mod reconciler;

pub use checkout::{CheckoutError, CheckoutService, CheckoutSettings, CheckoutStarted};
pub use notify::{EmailNotifier, NoopNotifier, NotifyError, OrderNotifier};
pub use reconciler::{
    CheckoutConfirmation, ConfirmationStatus, FallbackPolicy, OrderReconciler, ReconcileError,
    ReconcileOutcome, ReconcileTimeouts, WebhookReceipt,
};
