//! UMDH-format report writer.
//!
//! The output matches the text Microsoft's user-mode dump heap tool
//! produces, so the result can be fed straight into existing diff
//! tooling. The BackTrace id of a record is the address of the
//! return-address array inside its stack-trace record.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::warn;

use crate::env::{Mode, TargetEnv};
use crate::error::{self, Error};
use crate::processor::{AllocationRecord, Processor};
use crate::target::Target;
use crate::ust;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    Crlf,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::Crlf => "\r\n",
        }
    }
}

pub struct UmdhProcessor<'a, T: Target + ?Sized> {
    target: &'a T,
    env: TargetEnv,
    /// Cleared on the first failed write; the walk runs on without us.
    output: Option<File>,
    eol: LineEnding,
    /// BackTrace ids already dumped for the current heap.
    seen: BTreeSet<u64>,
}

impl<'a, T: Target + ?Sized> UmdhProcessor<'a, T> {
    /// Creates the report file (failing if it already exists) and writes
    /// the module header. Needs a recorded stack per allocation, so the
    /// target must run with UST or HPA.
    pub fn create(
        target: &'a T,
        env: TargetEnv,
        path: &Path,
        eol: LineEnding,
    ) -> error::Result<UmdhProcessor<'a, T>> {
        if env.mode() == Mode::Plain {
            return Err(Error::ModeUnavailable);
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(Error::OutputUnavailable)?;
        let mut processor = UmdhProcessor {
            target,
            env,
            output: Some(file),
            eol,
            seen: BTreeSet::new(),
        };
        processor.write_module_header()?;
        Ok(processor)
    }

    fn write_module_header(&mut self) -> error::Result<()> {
        let eol = self.eol.as_str();
        let mut text = format!("// Loaded modules:{eol}//     Base Size Module{eol}");
        for module in self.target.modules()? {
            text.push_str(&format!(
                "//    {:16X} {:8X} {}{eol}",
                module.base, module.size, module.name
            ));
        }
        text.push_str(&format!("//{eol}"));
        match self.output.as_mut() {
            Some(file) => file
                .write_all(text.as_bytes())
                .map_err(Error::OutputUnavailable),
            None => Ok(()),
        }
    }

    fn emit(&mut self, text: &str) {
        if let Some(file) = self.output.as_mut() {
            if let Err(err) = file.write_all(text.as_bytes()) {
                warn!("report write failed, dropping further output: {err}");
                self.output = None;
            }
        }
    }
}

impl<'a, T: Target + ?Sized> Processor for UmdhProcessor<'a, T> {
    fn start_heap(&mut self, heap_address: u64) {
        let eol = self.eol.as_str();
        self.emit(&format!(
            "{eol}*- - - - - - - - - - Start of data for heap @ {heap_address:X} - - - - - - - - - -{eol}\
             {eol}\
             REQUESTED bytes + OVERHEAD at ADDRESS by BackTraceID{eol}\
             \u{20}    STACK if not already dumped.{eol}\
             {eol}\
             *- - - - - - - - - - Heap {heap_address:X} Hogs - - - - - - - - - -{eol}\
             {eol}"
        ));
    }

    fn record(&mut self, record: &AllocationRecord) {
        let eol = self.eol.as_str();
        let backtrace = if record.ust_address != 0 {
            ust::trace_array_address(&self.env, record.ust_address)
        } else {
            0
        };
        let mut text = format!(
            "{:X} bytes + {:X} at {:X} by BackTrace{:X}{eol}",
            record.user_size,
            record.block_size - record.user_size,
            record.user_address,
            backtrace
        );
        if record.ust_address != 0 && self.seen.insert(backtrace) {
            let mut block = String::from(eol);
            block.push_str(&text);
            let trace =
                ust::read_stack_trace(self.target, &self.env, record.ust_address).unwrap_or_default();
            for frame in trace {
                block.push_str(&format!("\t{frame:X}{eol}"));
            }
            block.push_str(eol);
            text = block;
        }
        self.emit(&text);
    }

    fn finish_heap(&mut self, heap_address: u64) {
        let eol = self.eol.as_str();
        self.emit(&format!(
            "{eol}*- - - - - - - - - - End of data for heap @ {heap_address:X} - - - - - - - - - -{eol}{eol}"
        ));
        self.seen.clear();
    }
}
