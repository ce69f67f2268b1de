//! # gramflow core
//!
//! Data types shared by every layer of the gramflow dispatch core:
//!
//! - **Events**: the immutable inbound record ([`Event`], [`EventKind`], [`EventId`])
//! - **Outbound interface**: the [`Bot`] trait handlers use to act on the platform
//! - **Error vocabulary**: [`ApiError`], [`ErrorKind`] and the processing [`Stage`]
//!
//! ```text
//! ┌───────────┐     ┌────────────┐     ┌───────────┐     ┌─────┐
//! │ Transport │────▶│ EventQueue │────▶│ Dispatcher│────▶│ Bot │
//! │ (external)│     │            │     │  workers  │     │     │
//! └───────────┘     └────────────┘     └───────────┘     └─────┘
//! ```

pub mod bot;
pub mod error;
pub mod event;

pub use bot::{Bot, BoxedBot, DetachedBot, downcast_bot};
pub use error::{ApiError, ApiResult, ErrorKind, Stage};
pub use event::{Attachment, Event, EventBuilder, EventId, EventKind};
