//! Orders and payments for the funnel.
//!
//! The order ledger maps pending invoices back to the participant who asked
//! for them; the reconciler consumes provider notifications and grants
//! access exactly once per order. State lives in DashMap-backed stores
//! behind traits so a persistent backend can be swapped in.

#![warn(clippy::unwrap_used)]

pub mod gateway;
pub mod ledger;
pub mod reconcile;
pub mod signature;

pub use gateway::{Invoice, InvoiceProvider, InvoiceRequest, NowPaymentsProvider, RecordingInvoiceProvider};
pub use ledger::{InMemoryOrderStore, OrderLedger, OrderStore};
pub use reconcile::{PaymentReconciler, ReconcileOutcome};
pub use signature::SignatureVerifier;
