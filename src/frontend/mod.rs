pub mod m6502;
