//! campaignd: SMS campaign dispatch and response correlation.
//!
//! Two halves close one loop:
//!
//! ```text
//!  ListBuilder → VariantAssigner → Personalizer ──► memberships (pending)
//!                                                        │
//!                          DispatchScheduler ◄───────────┘
//!                                 │ claim → send
//!                                 ▼
//!                           SendGateway ──► provider
//!                                                │ webhooks (at-least-once)
//!  WebhookIngestor ◄─────────────────────────────┘
//!        │ status                │ inbound reply
//!        ▼                       ▼
//!   memberships ◄──────── ResponseCorrelator
//! ```
//!
//! Compliance (opt-outs, business hours, daily caps) is enforced at list-build,
//! send and reply time through [`compliance::ComplianceGuard`].

pub mod api;
pub mod bootstrap;
pub mod campaign;
pub mod clock;
pub mod compliance;
pub mod config;
pub mod correlate;
pub mod directory;
pub mod dispatch;
pub mod store;
pub mod telemetry;
pub mod webhook;
