pub mod client;
pub mod stream;
pub mod wire;

pub use client::FeedRestClient;
