pub mod app;
pub mod batching;
pub mod clock;
pub mod config;
pub mod content_filter;
pub mod crm;
pub mod engine;
pub mod error;
pub mod extract;
pub mod finalizer;
pub mod icp;
pub mod knowledge;
pub mod llm;
pub mod locks;
pub mod origin;
pub mod prompting;
pub mod registry;
pub mod scoring;
pub mod store;
pub mod types;
pub mod validation;
pub mod whatsapp;
