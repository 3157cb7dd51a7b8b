pub mod bridge;
pub mod broker;
pub mod collaborators;
pub mod consumer;
pub mod delivery;
pub mod fanout;
pub mod rate_limit;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod testing;
