//! Built-in workflow actions.

mod params;
mod send_email;
mod set_context;
mod set_field;
mod webhook;

pub use params::resolve_params;
pub use send_email::SendEmailAction;
pub use set_context::{SetContextAction, SetVariableAction};
pub use set_field::SetFieldAction;
pub use webhook::WebhookAction;
