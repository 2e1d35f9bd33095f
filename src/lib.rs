//! Batch certificate generation.
//!
//! Loads a list of recipients, cleans and de-duplicates it, renders one
//! personalised certificate image per recipient from a template, and mails
//! the certificates out through the Gmail API.

pub mod config;
pub mod context;
pub mod logging;
pub mod mail;
pub mod pool;
pub mod progress;
pub mod render;
pub mod roster;
pub mod userlist;

pub use userlist::{Recipient, Ulist, UserRecord};
