pub mod authorization;
pub mod credential;
pub mod crypto;
pub mod metadata;
pub mod profile;
pub mod proof;
pub mod token;
pub mod util;
pub mod verifier;
