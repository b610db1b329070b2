//! Test doubles for the router's collaborators. They are used for testing the router itself,
//!  but they are also exported for testing carrier layer implementations against the router.

pub mod carrier;
