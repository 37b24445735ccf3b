use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{error, trace};

/// Anything the reactor can watch: a descriptor, the interest set, an
/// optional per-socket deadline, and the callbacks the reactor invokes.
/// Within one `exec` pass `on_read` always fires before `on_write`, and
/// `on_timeout` fires only when `select` reported nothing ready.
pub trait Socket {
    fn fd(&self) -> RawFd;
    /// (read interest, write interest)
    fn mode(&self) -> (bool, bool);
    fn timeout(&self) -> Option<Duration> {
        None
    }
    fn on_read(&mut self);
    fn on_write(&mut self);
    fn on_timeout(&mut self) {}
}

/// Write end of the reactor's self-pipe; cloned into worker threads so
/// they can interrupt a blocking `select`.
#[derive(Clone)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn wake(&self) {
        loop {
            let n = unsafe { libc::write(self.fd, b"w".as_ptr().cast(), 1) };
            if n >= 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break;
            }
        }
    }
}

/// Single-threaded `select(2)` loop with a self-wakeup pipe.
pub struct Select {
    pipe: [RawFd; 2],
}

impl Select {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Select { pipe: fds })
    }

    pub fn waker(&self) -> Waker {
        Waker { fd: self.pipe[1] }
    }

    /// One multiplexer pass: waits for readiness on every registered
    /// socket (or the self-pipe), dispatches callbacks, and returns the
    /// number of ready descriptors.
    pub fn exec(
        &self,
        sockets: &mut [&mut dyn Socket],
        max_timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let started = Instant::now();
        let mut timeout = max_timeout;
        let mut deadlines: Vec<Option<Duration>> = Vec::with_capacity(sockets.len());
        let mut interests: Vec<(RawFd, bool, bool)> = Vec::with_capacity(sockets.len());

        for socket in sockets.iter() {
            let per_socket = socket.timeout();
            deadlines.push(per_socket);
            if let Some(to) = per_socket {
                timeout = Some(match timeout {
                    Some(current) => current.min(to),
                    None => to,
                });
            }
            let fd = socket.fd();
            let (read, write) = socket.mode();
            if fd >= 0 && (read || write) {
                interests.push((fd, read, write));
            }
        }

        let mut read_set = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut write_set = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let ready = loop {
            let mut max_fd = self.pipe[0];
            unsafe {
                libc::FD_ZERO(&mut read_set);
                libc::FD_ZERO(&mut write_set);
                libc::FD_SET(self.pipe[0], &mut read_set);
                for &(fd, read, write) in &interests {
                    max_fd = max_fd.max(fd);
                    if read {
                        libc::FD_SET(fd, &mut read_set);
                    }
                    if write {
                        libc::FD_SET(fd, &mut write_set);
                    }
                }
            }
            let mut tv = timeout.map(|to| libc::timeval {
                tv_sec: to.as_secs() as libc::time_t,
                tv_usec: to.subsec_micros() as libc::suseconds_t,
            });
            let tv_ptr = tv
                .as_mut()
                .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);
            let ret = unsafe {
                libc::select(
                    max_fd + 1,
                    &mut read_set,
                    &mut write_set,
                    std::ptr::null_mut(),
                    tv_ptr,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("select failed: {err}");
                return Err(err);
            }
        };

        let elapsed = started.elapsed();
        trace!("select woke with {ready} ready after {elapsed:?}");

        let mut ready_left = ready;
        if ready_left > 0 && unsafe { libc::FD_ISSET(self.pipe[0], &read_set) } {
            ready_left -= 1;
            let mut buf = [0u8; 64];
            while unsafe { libc::read(self.pipe[0], buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
        }

        for (socket, deadline) in sockets.iter_mut().zip(deadlines) {
            if ready_left == 0 {
                if let Some(to) = deadline {
                    if elapsed >= to {
                        socket.on_timeout();
                    }
                }
                continue;
            }
            let fd = socket.fd();
            if fd < 0 {
                continue;
            }
            unsafe {
                if libc::FD_ISSET(fd, &read_set) {
                    socket.on_read();
                }
            }
            // the callback may have closed the descriptor
            if socket.fd() == fd {
                unsafe {
                    if libc::FD_ISSET(fd, &write_set) {
                        socket.on_write();
                    }
                }
            }
        }

        Ok(ready)
    }
}

impl Drop for Select {
    fn drop(&mut self) {
        for fd in self.pipe {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PipeSocket {
        fd: RawFd,
        reads: usize,
        timeouts: usize,
        deadline: Option<Duration>,
    }

    impl Socket for PipeSocket {
        fn fd(&self) -> RawFd {
            self.fd
        }
        fn mode(&self) -> (bool, bool) {
            (true, false)
        }
        fn timeout(&self) -> Option<Duration> {
            self.deadline
        }
        fn on_read(&mut self) {
            self.reads += 1;
            let mut buf = [0u8; 16];
            unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        }
        fn on_write(&mut self) {}
        fn on_timeout(&mut self) {
            self.timeouts += 1;
        }
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn dispatches_read_when_data_arrives() {
        let select = Select::new().unwrap();
        let (rx, tx) = pipe_pair();
        let mut socket = PipeSocket {
            fd: rx,
            reads: 0,
            timeouts: 0,
            deadline: None,
        };
        assert_eq!(unsafe { libc::write(tx, b"x".as_ptr().cast(), 1) }, 1);
        let ready = select
            .exec(&mut [&mut socket], Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(ready, 1);
        assert_eq!(socket.reads, 1);
        assert_eq!(socket.timeouts, 0);
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn fires_timeout_when_idle() {
        let select = Select::new().unwrap();
        let (rx, tx) = pipe_pair();
        let mut socket = PipeSocket {
            fd: rx,
            reads: 0,
            timeouts: 0,
            deadline: Some(Duration::from_millis(10)),
        };
        select.exec(&mut [&mut socket], None).unwrap();
        assert_eq!(socket.reads, 0);
        assert_eq!(socket.timeouts, 1);
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn waker_interrupts_select() {
        let select = Select::new().unwrap();
        let waker = select.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        let ready = select.exec(&mut [], Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready, 1);
        handle.join().unwrap();
    }
}
