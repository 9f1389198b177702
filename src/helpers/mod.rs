pub mod browser;
pub mod email;
pub mod export;
pub mod pdf;
