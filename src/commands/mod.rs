pub mod bot;
pub mod credentials;
pub mod health;
pub mod price_feed;
