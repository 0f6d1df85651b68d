pub mod access;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod http;
pub mod lifecycle;
pub mod media;
pub mod notify;
pub mod service;
pub mod stats;

pub mod api {
    pub mod ticket;
    pub mod user;

    pub use self::{ticket::Ticket, user::User};
}

pub use self::config::Config;
