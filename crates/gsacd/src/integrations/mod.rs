pub mod gsac;
pub mod mqtt;
