pub mod dashboard;
pub mod run;
