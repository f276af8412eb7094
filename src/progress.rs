//! Progress bars for asset transfers.

use std::io::{self, Read};

use indicatif::{HumanBytes, ProgressBar, ProgressBarIter, ProgressStyle};

use crate::cancel::CancellationToken;

const TEMPLATE: &str =
    "  {prefix} {bar:30.cyan/dim} {bytes}/{total_bytes} {bytes_per_sec:.dim} {eta:.dim}";

/// Reader that drives a progress bar and honours cancellation.
///
/// The bar draws to stderr and stays hidden when stderr is not a terminal;
/// start and end of each transfer are always logged.
pub struct ProgressReader<R> {
    inner: ProgressBarIter<R>,
    bar: ProgressBar,
    label: String,
    cancel: CancellationToken,
    finished: bool,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, label: impl Into<String>, total: u64, cancel: CancellationToken) -> Self {
        let label = label.into();
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar().template(TEMPLATE) {
            bar.set_style(style);
        }
        bar.set_prefix(label.clone());
        log::info!("{}: transferring {}", label, HumanBytes(total));
        Self {
            inner: bar.wrap_read(inner),
            bar,
            label,
            cancel,
            finished: false,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.bar.position()
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.bar.finish_and_clear();
        log::info!("{}: {} transferred", self.label, HumanBytes(self.bar.position()));
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            self.bar.abandon();
            return Err(CancellationToken::io_error());
        }
        let read = self.inner.read(buf)?;
        if read == 0 && !buf.is_empty() {
            self.finish();
        }
        Ok(read)
    }
}
