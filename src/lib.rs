//! Mentorship chat service for the placement portal: persisted
//! student/TPO conversations with read tracking, plus room-scoped
//! realtime delivery over WebSocket.

pub mod chat;
pub mod error;
pub mod gateway;
pub mod principal;
pub mod registry;
pub mod routes;
pub mod store;
