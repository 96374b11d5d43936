//! Collaborators the fulfillment core consumes but does not own.

pub mod catalog;
pub mod notification;
