//! FIFO control front end: fire-and-forget, same grammar as the TCP side
//! but responses are discarded (spec.md §4.5/§6).
//!
//! Grounded on `glb_main.c`'s `open(fifo_name, O_RDWR)` (read-write so the
//! FIFO never reports EOF for lack of a writer) and `glb_control.c`'s
//! single poll loop with a timeout, reproduced here as a non-blocking read
//! retried on a short sleep so the thread notices `terminate` promptly.
//! Creating the FIFO node itself is the caller's responsibility — this
//! module only speaks the byte protocol over an already-existing path.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use control::{handle_line, Context};

pub struct FifoControl {
    reader: BufReader<File>,
    ctx: Context,
    terminate: Arc<AtomicBool>,
}

impl FifoControl {
    pub fn open<P: AsRef<Path>>(path: P, ctx: Context, terminate: Arc<AtomicBool>) -> io::Result<FifoControl> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        set_nonblocking(&file)?;
        Ok(FifoControl { reader: BufReader::new(file), ctx, terminate })
    }

    pub fn run(mut self) {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                info!("control: fifo thread shutting down");
                return;
            }
            match self.reader.read(&mut byte) {
                Ok(0) => thread::sleep(Duration::from_millis(200)),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        if !line.is_empty() {
                            if let Ok(text) = String::from_utf8(line.clone()) {
                                // Discarded: a FIFO writer would read its
                                // own reply back.
                                let _ = handle_line(&self.ctx, &text);
                            }
                            line.clear();
                        }
                    } else {
                        line.push(byte[0]);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    warn!("control: fifo read failed: {}", e);
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    unsafe {
        let flags = ::libc::fcntl(fd, ::libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if ::libc::fcntl(fd, ::libc::F_SETFL, flags | ::libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
