// Research Agent - iterative research-and-report service

pub mod config;
pub mod types;
pub mod models;
pub mod evidence;
pub mod gateway;
pub mod llm;
pub mod search;    // Web search (SerpAPI)
pub mod fetch;     // Page download and text extraction
pub mod agents;    // Planner, executor, critic, synthesizer
pub mod controller;
pub mod session;
pub mod routes;
pub mod middleware;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
