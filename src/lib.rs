//! Decode-and-evaluate engine for short vendor-defined BLE advertising
//! payloads: declarative register extraction plus threshold alarms with
//! hysteresis. Receiving the advertisements and persisting the results are
//! both left to the embedding application.

pub mod alarms;
pub mod commands;
pub mod device;
pub mod devices;
pub mod output;
pub mod registers;
pub mod settings;
