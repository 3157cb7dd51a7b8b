pub mod gateway;
pub mod middleware;
pub mod routes;
pub mod state;
