//! End-to-end ring tests: real files, sockets, and timers driven through
//! the scheduler.

use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use corio_io::{IoBatch, IoLink, IoService};
use corio_runtime::{generator, launch, Scheduler, SchedulerConfig};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

fn sched(workers: usize) -> Arc<Scheduler> {
    Scheduler::with_config(SchedulerConfig {
        workers,
        park_timeout: Duration::from_millis(20),
    })
}

fn temp_path(tag: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("corio-io-{}-{}", std::process::id(), tag));
    p
}

#[test]
fn read_file_contents() {
    let path = temp_path("read");
    fs::File::create(&path)
        .unwrap()
        .write_all(b"0123456789")
        .unwrap();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());
    let file = fs::File::open(&path).unwrap();
    let fd = file.as_raw_fd();

    let io2 = Arc::clone(&io);
    let (n, data) = launch(async move {
        let mut buf = [0u8; 32];
        let n = io2.read(fd, &mut buf, 0).await;
        (n, buf)
    })
    .schedule_on(&s)
    .join();

    assert_eq!(n, 10);
    assert_eq!(&data[..10], b"0123456789");
    drop(file);
    fs::remove_file(&path).unwrap();
    io.shutdown();
    s.shutdown();
}

#[test]
fn openat_read_close_sequence() {
    let path = temp_path("openat");
    fs::File::create(&path)
        .unwrap()
        .write_all(b"sequence")
        .unwrap();
    let cpath = CString::new(path.to_str().unwrap()).unwrap();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());

    let io2 = Arc::clone(&io);
    let out = launch(async move {
        let fd = io2.openat(libc::AT_FDCWD, &cpath, libc::O_RDONLY, 0).await;
        assert!(fd >= 0, "openat failed: {}", fd);
        let mut buf = [0u8; 16];
        let n = io2.read(fd, &mut buf, 0).await;
        assert_eq!(n, 8);
        assert_eq!(io2.close(fd).await, 0);
        buf
    })
    .schedule_on(&s)
    .join();

    assert_eq!(&out[..8], b"sequence");
    fs::remove_file(&path).unwrap();
    io.shutdown();
    s.shutdown();
}

#[test]
fn write_then_read_back() {
    let path = temp_path("write");
    fs::File::create(&path).unwrap();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let fd = file.as_raw_fd();

    let io2 = Arc::clone(&io);
    launch(async move {
        assert_eq!(io2.write(fd, b"payload", 0).await, 7);
        let mut buf = [0u8; 16];
        assert_eq!(io2.read(fd, &mut buf, 0).await, 7);
        assert_eq!(&buf[..7], b"payload");
    })
    .schedule_on(&s)
    .join();

    drop(file);
    fs::remove_file(&path).unwrap();
    io.shutdown();
    s.shutdown();
}

#[test]
fn timeout_elapses() {
    let s = sched(1);
    let io = Arc::new(IoService::new().unwrap());

    let io2 = Arc::clone(&io);
    let started = Instant::now();
    let res = launch(async move { io2.timeout(Duration::from_millis(50)).await })
        .schedule_on(&s)
        .join();

    assert_eq!(res, -libc::ETIME);
    assert!(started.elapsed() >= Duration::from_millis(45));
    io.shutdown();
    s.shutdown();
}

#[test]
fn poll_add_waits_for_eventfd() {
    let efd = unsafe { libc::eventfd(0, 0) };
    assert!(efd >= 0);

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        let one: u64 = 1;
        let n = unsafe {
            libc::write(efd, &one as *const u64 as *const libc::c_void, 8)
        };
        assert_eq!(n, 8);
    });

    let io2 = Arc::clone(&io);
    let value = launch(async move {
        let events = io2.poll_add(efd, libc::POLLIN as u32).await;
        assert!(events > 0 && events & libc::POLLIN as i32 != 0);
        let mut buf = [0u8; 8];
        assert_eq!(io2.read(efd, &mut buf, 0).await, 8);
        u64::from_ne_bytes(buf)
    })
    .schedule_on(&s)
    .join();

    assert_eq!(value, 1);
    writer.join().unwrap();
    unsafe { libc::close(efd) };
    io.shutdown();
    s.shutdown();
}

#[test]
fn send_recv_over_socketpair() {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());
    let (fd_a, fd_b) = (a.as_raw_fd(), b.as_raw_fd());

    let io2 = Arc::clone(&io);
    let got = launch(async move {
        assert_eq!(io2.send(fd_a, b"ping", 0).await, 4);
        let mut buf = [0u8; 8];
        let n = io2.recv(fd_b, &mut buf, 0).await;
        assert_eq!(n, 4);
        buf[..4].to_vec()
    })
    .schedule_on(&s)
    .join();

    assert_eq!(got, b"ping");
    io.shutdown();
    s.shutdown();
}

#[test]
fn recv_select_picks_a_provided_buffer() {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();

    const GROUP: u16 = 7;
    const EACH: usize = 64;
    const COUNT: usize = 4;

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());
    let (fd_a, fd_b) = (a.as_raw_fd(), b.as_raw_fd());

    let io2 = Arc::clone(&io);
    launch(async move {
        let mut pool = [0u8; EACH * COUNT];
        let res = io2
            .provide_buffers(&mut pool, EACH as u32, COUNT as u16, GROUP, 0)
            .await;
        assert!(res >= 0, "provide_buffers failed: {}", res);

        assert_eq!(io2.send(fd_a, b"pick", 0).await, 4);

        let (n, bid) = io2.recv_select(fd_b, EACH as u32, GROUP, 0).await;
        assert_eq!(n, 4);
        let bid = bid.expect("kernel did not report a buffer id") as usize;
        assert!(bid < COUNT);
        assert_eq!(&pool[bid * EACH..bid * EACH + 4], b"pick");
    })
    .schedule_on(&s)
    .join();

    io.shutdown();
    s.shutdown();
}

#[test]
fn cancel_op_stops_inflight_poll() {
    let efd = unsafe { libc::eventfd(0, 0) };
    assert!(efd >= 0);

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());

    let io2 = Arc::clone(&io);
    launch(async move {
        // Nothing will ever arrive on the eventfd; cancel the poll.
        let poll = io2.poll_add(efd, libc::POLLIN as u32);
        let target = poll.user_data();
        let cancel = io2.cancel_op(target);
        let res = poll.await;
        assert_eq!(res, -libc::ECANCELED);
        assert_eq!(cancel.await, 0);
    })
    .schedule_on(&s)
    .join();

    unsafe { libc::close(efd) };
    io.shutdown();
    s.shutdown();
}

#[test]
fn batch_submits_in_one_pass() {
    let path = temp_path("batch");
    fs::File::create(&path).unwrap();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let fd = file.as_raw_fd();

    let io2 = Arc::clone(&io);
    launch(async move {
        let mut batch = IoBatch::new(&io2);
        let w1 = batch.write(fd, b"aaaa", 0);
        let w2 = batch.write(fd, b"bbbb", 4);
        batch.submit();
        assert_eq!(w1.await, 4);
        assert_eq!(w2.await, 4);

        let mut buf = [0u8; 8];
        assert_eq!(io2.read(fd, &mut buf, 0).await, 8);
        assert_eq!(&buf, b"aaaabbbb");
    })
    .schedule_on(&s)
    .join();

    drop(file);
    fs::remove_file(&path).unwrap();
    io.shutdown();
    s.shutdown();
}

#[test]
fn link_orders_write_before_read() {
    let path = temp_path("link");
    fs::File::create(&path).unwrap();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let fd = file.as_raw_fd();

    let io2 = Arc::clone(&io);
    launch(async move {
        let mut buf = [0u8; 8];
        let mut link = IoLink::new(&io2);
        let w = link.write(fd, b"ordered", 0);
        let r = link.read(fd, &mut buf, 0);
        link.submit();
        // The read is hard-linked behind the write, so it must see the
        // written bytes even though both went in together.
        assert_eq!(w.await, 7);
        assert_eq!(r.await, 7);
        assert_eq!(&buf[..7], b"ordered");
    })
    .schedule_on(&s)
    .join();

    drop(file);
    fs::remove_file(&path).unwrap();
    io.shutdown();
    s.shutdown();
}

#[test]
fn accept_generator_until_cancelled() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let lfd = listener.as_raw_fd();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());

    let connectors: Vec<_> = (0..3)
        .map(|_| {
            thread::spawn(move || {
                let sock = std::net::TcpStream::connect(addr).unwrap();
                thread::sleep(Duration::from_millis(100));
                drop(sock);
            })
        })
        .collect();

    let io2 = Arc::clone(&io);
    launch(async move {
        let io3 = Arc::clone(&io2);
        let mut incoming = generator(move |y| async move {
            let token = corio_runtime::current_stop_token();
            loop {
                if token.stop_requested() {
                    io3.close(lfd).await;
                    return;
                }
                let conn = io3.accept(lfd, 0).await;
                assert!(conn >= 0, "accept failed: {}", conn);
                y.yield_value(conn).await;
            }
        });

        for _ in 0..3 {
            let conn = incoming.resume().await.unwrap();
            io2.close(conn).await;
        }
        assert_eq!(incoming.cancel().await, None);
        assert!(!incoming.is_active());
    })
    .schedule_on(&s)
    .join();

    // The generator closed the listener on its way out.
    assert_eq!(unsafe { libc::fcntl(lfd, libc::F_GETFD) }, -1);

    for c in connectors {
        c.join().unwrap();
    }
    std::mem::forget(listener);
    io.shutdown();
    s.shutdown();
}

#[test]
fn accept_addr_reports_peer() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let lfd = listener.as_raw_fd();

    let s = sched(2);
    let io = Arc::new(IoService::new().unwrap());

    let connector = thread::spawn(move || {
        let sock = std::net::TcpStream::connect(addr).unwrap();
        let local = sock.local_addr().unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(sock);
        local
    });

    let io2 = Arc::clone(&io);
    let (conn, peer, len) = launch(async move {
        let got = io2.accept_addr(lfd, 0).await;
        assert!(got.0 >= 0, "accept failed: {}", got.0);
        io2.close(got.0).await;
        got
    })
    .schedule_on(&s)
    .join();

    assert!(conn >= 0);
    assert!(len as usize >= std::mem::size_of::<libc::sockaddr_in>());
    assert_eq!(peer.ss_family, libc::AF_INET as libc::sa_family_t);

    // The kernel-reported peer is the connector's own local endpoint.
    let sin = unsafe { *(&peer as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
    let connected_from = connector.join().unwrap();
    assert_eq!(u16::from_be(sin.sin_port), connected_from.port());

    drop(listener);
    io.shutdown();
    s.shutdown();
}

#[test]
fn delayed_runs_after_the_timer() {
    let s = sched(1);
    let io = Arc::new(IoService::new().unwrap());

    let io2 = Arc::clone(&io);
    let started = Instant::now();
    let v = launch(async move { corio_io::delayed(&io2, Duration::from_millis(40), async { 9 }).await })
        .schedule_on(&s)
        .join();

    assert_eq!(v, 9);
    assert!(started.elapsed() >= Duration::from_millis(35));
    io.shutdown();
    s.shutdown();
}
