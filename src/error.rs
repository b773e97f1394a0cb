use core::result;
use std::io;

use quick_error::quick_error;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        /// Target memory could not be read (exact-length read failed).
        NotReadable(address: u64, size: usize) {
            display("cannot read {} bytes at {:#x}", size, address)
        }
        /// A symbolic field-offset lookup failed.
        UnknownField(type_name: String, field: String) {
            display("cannot resolve {}.{}", type_name, field)
        }
        /// A symbolic type or expression lookup failed.
        UnknownSymbol(expr: String) {
            display("cannot resolve {}", expr)
        }
        /// The XOR checksum of a decoded heap entry header did not cancel.
        HeaderInvalid(address: u64) {
            display("heap entry checksum failed at {:#x}", address)
        }
        /// The command needs the UST or HPA flag and neither is set.
        ModeUnavailable {
            display("please set ust or hpa by gflags.exe")
        }
        /// The report file could not be created or written.
        OutputUnavailable(err: io::Error) {
            display("output unavailable: {}", err)
            source(err)
        }
        /// The command line or a target structure is malformed in some way.
        Malformed(msg: String) {
            display("malformed: {}", msg)
        }
        /// Fixed-width decoding of fetched bytes failed.
        Scroll(err: scroll::Error) {
            from()
            display("decode error: {}", err)
            source(err)
        }
        /// Console I/O failed.
        Io(err: io::Error) {
            from()
            display("i/o error: {}", err)
            source(err)
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
