pub mod approval;
pub mod module;
pub mod session;
pub mod version;
