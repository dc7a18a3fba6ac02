pub mod call;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod media;
pub mod phone;
pub mod useragent;

pub use phone::{Softphone, SoftphoneBuilder};
