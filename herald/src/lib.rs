pub mod console_sink;
pub mod controller;
