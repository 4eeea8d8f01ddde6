pub mod checks;
pub mod containers;
pub mod ports;
pub mod system;
