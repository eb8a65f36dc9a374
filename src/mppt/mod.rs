// SunSaver MPPT telemetry: register table, wire frame, decoder and poll session.
pub mod decoder;
pub mod frame;
pub mod schema;
pub mod session;
