pub mod commands;
pub mod connection;
pub mod kamstrup;
pub mod output;
pub mod registers;
