//! Request and response bodies of the deploy portal HTTP API

pub mod models;
