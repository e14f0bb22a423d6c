//! Integration tests for the tinyk kernel
//!
//! End-to-end scenarios driven through the syscall surface: every test
//! boots a fresh kernel with an init task and inspects what it observed.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use tinyk::kernel::{
    KernelConfig, NOPORT, PipeError, SchedCause, ShutdownMode, SocketError, SyscallError,
    ThreadError, Tid, TraceCategory,
};
use tinyk::{BootReport, Kernel, Sys, Task};

fn boot_with<F, Fut>(config: KernelConfig, init: F) -> (Rc<Kernel>, BootReport)
where
    F: Fn(Sys, Vec<u8>) -> Fut + 'static,
    Fut: Future<Output = i32> + 'static,
{
    let kernel = Kernel::new(config).expect("valid config");
    let report = kernel.boot(Task::new(init), &[]);
    (kernel, report)
}

fn boot<F, Fut>(init: F) -> BootReport
where
    F: Fn(Sys, Vec<u8>) -> Fut + 'static,
    Fut: Future<Output = i32> + 'static,
{
    Kernel::with_defaults().boot(Task::new(init), &[])
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Threads
// ============================================================================

#[test]
fn test_threads_share_counter() {
    let counter = Rc::new(Cell::new(0));
    let sink = counter.clone();

    let report = boot(move |sys, _| {
        let sink = sink.clone();
        async move {
            let process = Task::new(move |sys, _| {
                let counter = sink.clone();
                async move {
                    let worker = {
                        let counter = counter.clone();
                        Task::new(move |sys, _| {
                            let counter = counter.clone();
                            async move {
                                counter.set(counter.get() + 1);
                                sys.thread_exit(0).await
                            }
                        })
                    };

                    let tids: Vec<Tid> = (0..3)
                        .map(|_| sys.create_thread(&worker, b"").unwrap())
                        .collect();
                    for tid in tids {
                        assert_eq!(sys.thread_join(tid).await, Ok(0));
                    }
                    counter.get()
                }
            });

            let pid = sys.exec(&process, b"").unwrap();
            let (_, status) = sys.wait_child(Some(pid)).await.unwrap();
            status
        }
    });

    assert_eq!(counter.get(), 3);
    assert_eq!(report.init_status, Some(3));
    assert_eq!(report.stats.threads_created, 5);
}

#[test]
fn test_detach_fails_blocked_joiners() {
    let finished_at = Rc::new(Cell::new(-1.0));
    let sink = finished_at.clone();

    boot(move |sys, _| {
        let sink = sink.clone();
        async move {
            let sleeper = Task::new(|sys, _| async move {
                sys.sleep(100.0).await;
                1
            });
            let joiner = Task::new(|sys, args| async move {
                let raw: [u8; 8] = args[..8].try_into().unwrap();
                match sys.thread_join(Tid(u64::from_le_bytes(raw))).await {
                    Err(SyscallError::Thread(ThreadError::Detached)) => 1,
                    _ => 0,
                }
            });

            let target = sys.create_thread(&sleeper, b"").unwrap();
            let arg = target.0.to_le_bytes();
            let joiners = [
                sys.create_thread(&joiner, &arg).unwrap(),
                sys.create_thread(&joiner, &arg).unwrap(),
            ];

            sys.sleep(10.0).await;
            sys.thread_detach(target).unwrap();

            for tid in joiners {
                assert_eq!(sys.thread_join(tid).await, Ok(1));
            }
            sink.set(sys.now());
            0
        }
    });

    // Joiners were released by the detach, not by the sleeper's exit
    assert_eq!(finished_at.get(), 10.0);
}

// ============================================================================
// Pipes
// ============================================================================

/// Push `total` bytes through a pipe in `chunk`-sized writes from one thread
/// while another drains it; returns what the reader saw.
fn pump(total: usize, chunk: usize, capacity: usize) -> Vec<u8> {
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let config = KernelConfig {
        pipe_buffer_size: capacity,
        ..KernelConfig::default()
    };

    let (_, report) = boot_with(config, move |sys, _| {
        let sink = sink.clone();
        async move {
            let (r, w) = sys.pipe().unwrap();

            let writer = Task::new(move |sys, _| async move {
                let data = pattern(total);
                for piece in data.chunks(chunk) {
                    assert_eq!(sys.write(w, piece).await, Ok(piece.len()));
                }
                sys.close(w).unwrap();
                0
            });
            let reader = Task::new(move |sys, _| {
                let sink = sink.clone();
                async move {
                    let mut buf = vec![0u8; 3000];
                    loop {
                        let n = sys.read(r, &mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        sink.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                    0
                }
            });

            let tw = sys.create_thread(&writer, b"").unwrap();
            let tr = sys.create_thread(&reader, b"").unwrap();
            sys.thread_join(tw).await.unwrap();
            sys.thread_join(tr).await.unwrap();
            0
        }
    });

    assert_eq!(report.stalled, 0);
    received.take()
}

#[test]
fn test_pipe_moves_more_than_capacity() {
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();

    let report = boot(move |sys, _| {
        let sink = sink.clone();
        async move {
            let (r, w) = sys.pipe().unwrap();

            let writer = Task::new(move |sys, _| async move {
                sys.write(w, &pattern(20000)).await.unwrap() as i32
            });
            let reader = Task::new(move |sys, _| {
                let sink = sink.clone();
                async move {
                    let mut buf = vec![0u8; 20000];
                    let n = sys.read(r, &mut buf).await.unwrap();
                    sink.borrow_mut().extend_from_slice(&buf[..n]);
                    n as i32
                }
            });

            let tw = sys.create_thread(&writer, b"").unwrap();
            let tr = sys.create_thread(&reader, b"").unwrap();
            assert_eq!(sys.thread_join(tw).await, Ok(20000));
            assert_eq!(sys.thread_join(tr).await, Ok(20000));
            0
        }
    });

    assert_eq!(*received.borrow(), pattern(20000));
    assert_eq!(report.stats.bytes_written, 20000);
    assert_eq!(report.stats.bytes_read, 20000);
    assert_eq!(report.stalled, 0);
}

#[test]
fn test_pipe_any_chunking() {
    for chunk in [1, 7, 1000, 4096, 8192, 10000] {
        assert_eq!(pump(20000, chunk, 8192), pattern(20000), "chunk {}", chunk);
    }
    // A tiny buffer forces a block on nearly every byte
    assert_eq!(pump(500, 13, 3), pattern(500));
}

#[test]
fn test_pipe_drains_after_writer_closes() {
    let report = boot(|sys, _| async move {
        let (r, w) = sys.pipe().unwrap();
        assert_eq!(sys.write(w, b"hello").await, Ok(5));
        sys.close(w).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(sys.read(r, &mut buf).await, Ok(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(sys.read(r, &mut buf).await, Ok(0));
        assert_eq!(sys.read(r, &mut buf).await, Ok(0));
        0
    });

    // Nothing ever blocked
    assert_eq!(report.uptime, 0.0);
    assert_eq!(report.init_status, Some(0));
}

#[test]
fn test_pipe_write_to_closed_reader() {
    boot(|sys, _| async move {
        let (r, w) = sys.pipe().unwrap();
        sys.close(r).unwrap();
        assert_eq!(
            sys.write(w, b"lost").await,
            Err(SyscallError::Pipe(PipeError::BrokenPipe))
        );
        0
    });
}

// ============================================================================
// Sockets
// ============================================================================

#[test]
fn test_socket_duplex_round_trip() {
    let reply = Rc::new(RefCell::new(Vec::new()));
    let sink = reply.clone();

    let report = boot(move |sys, _| {
        let sink = sink.clone();
        async move {
            let server = Task::new(|sys, _| async move {
                let listener = sys.socket(80).unwrap();
                sys.listen(listener).unwrap();
                let peer = sys.accept(listener).await.unwrap();

                let mut buf = [0u8; 4];
                assert_eq!(sys.read(peer, &mut buf).await, Ok(4));
                assert_eq!(&buf, b"ping");
                sys.write(peer, b"pong").await.unwrap();

                sys.close(peer).unwrap();
                sys.close(listener).unwrap();
                0
            });
            let client = Task::new(move |sys, _| {
                let sink = sink.clone();
                async move {
                    sys.sleep(1.0).await;
                    let sock = sys.socket(NOPORT).unwrap();
                    sys.connect(sock, 80, 100.0).await.unwrap();
                    sys.write(sock, b"ping").await.unwrap();

                    let mut buf = [0u8; 4];
                    assert_eq!(sys.read(sock, &mut buf).await, Ok(4));
                    sink.borrow_mut().extend_from_slice(&buf);

                    // The server hung up
                    assert_eq!(sys.read(sock, &mut buf).await, Ok(0));
                    0
                }
            });

            let s = sys.exec(&server, b"").unwrap();
            let c = sys.exec(&client, b"").unwrap();
            assert_eq!(sys.wait_child(Some(s)).await, Ok((s, 0)));
            assert_eq!(sys.wait_child(Some(c)).await, Ok((c, 0)));
            0
        }
    });

    assert_eq!(reply.borrow().as_slice(), b"pong");
    assert_eq!(report.stats.connections_accepted, 1);
    assert_eq!(report.stats.connections_failed, 0);
    assert_eq!(report.stats.connect_timeouts, 0);
}

#[test]
fn test_socket_half_close() {
    boot(|sys, _| async move {
        let listener = sys.socket(9).unwrap();
        sys.listen(listener).unwrap();

        let client = Task::new(|sys, _| async move {
            let sock = sys.socket(NOPORT).unwrap();
            sys.connect(sock, 9, 50.0).await.unwrap();
            sys.shutdown(sock, ShutdownMode::Write).unwrap();
            assert_eq!(
                sys.write(sock, b"x").await,
                Err(SyscallError::Pipe(PipeError::WriterClosed))
            );
            assert_eq!(
                sys.shutdown(sock, ShutdownMode::Write),
                Err(SyscallError::Socket(SocketError::AlreadyShutdown))
            );

            let mut buf = [0u8; 5];
            assert_eq!(sys.read(sock, &mut buf).await, Ok(5));
            assert_eq!(&buf, b"reply");
            0
        });
        let tid = sys.create_thread(&client, b"").unwrap();

        let peer = sys.accept(listener).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(sys.read(peer, &mut buf).await, Ok(0));
        assert_eq!(sys.write(peer, b"reply").await, Ok(5));

        assert_eq!(sys.thread_join(tid).await, Ok(0));
        0
    });
}

#[test]
fn test_connect_without_listener_fails_immediately() {
    let report = boot(|sys, _| async move {
        let sock = sys.socket(NOPORT).unwrap();
        assert_eq!(
            sys.connect(sock, 42, 1000.0).await,
            Err(SyscallError::Socket(SocketError::ConnectionRefused))
        );
        assert_eq!(sys.now(), 0.0);
        0
    });

    assert_eq!(report.uptime, 0.0);
    assert_eq!(report.stats.connections_failed, 1);
    assert_eq!(report.stats.connect_timeouts, 0);
}

#[test]
fn test_connect_times_out_without_accept() {
    let (kernel, report) = boot_with(KernelConfig::default(), |sys, _| async move {
        let listener = sys.socket(42).unwrap();
        sys.listen(listener).unwrap();

        let sock = sys.socket(NOPORT).unwrap();
        assert_eq!(
            sys.connect(sock, 42, 250.0).await,
            Err(SyscallError::Socket(SocketError::TimedOut))
        );
        assert_eq!(sys.now(), 250.0);

        // The socket is still unbound and may try again
        assert_eq!(
            sys.connect(sock, 42, 50.0).await,
            Err(SyscallError::Socket(SocketError::TimedOut))
        );
        0
    });

    assert_eq!(report.uptime, 300.0);
    assert_eq!(report.stats.connections_failed, 2);
    assert_eq!(report.stats.connect_timeouts, 2);
    assert!(kernel.listening_ports().is_empty());
}

// ============================================================================
// Boot, configuration and introspection
// ============================================================================

#[test]
fn test_config_from_json_with_tracing() {
    let config = KernelConfig::from_json(
        r#"{"max_processes": 8, "max_fileid": 4, "pipe_buffer_size": 16, "trace": true}"#,
    )
    .unwrap();
    assert_eq!(config.max_port, KernelConfig::default().max_port);

    let snapshot = Rc::new(RefCell::new(serde_json::Value::Null));
    let sink = snapshot.clone();

    let (kernel, report) = boot_with(config, move |sys, _| {
        let sink = sink.clone();
        async move {
            let (r, w) = sys.pipe().unwrap();
            let child = Task::new(move |sys, _| async move {
                sys.write(w, b"0123456789abcdefXYZ").await.unwrap() as i32
            });
            let pid = sys.exec(&child, b"argv").unwrap();
            *sink.borrow_mut() = serde_json::to_value(sys.process_info()).unwrap();

            let mut buf = [0u8; 19];
            assert_eq!(sys.read(r, &mut buf).await, Ok(19));

            assert_eq!(sys.wait_child(Some(pid)).await, Ok((pid, 19)));
            0
        }
    });

    assert_eq!(report.init_status, Some(0));

    // idle, init and the freshly started writer
    let procs = snapshot.borrow();
    let procs = procs.as_array().unwrap();
    assert_eq!(procs.len(), 3);
    assert_eq!(procs[2]["argl"], 4);
    assert_eq!(procs[2]["ppid"], 1);

    let events = kernel.trace_events();
    assert!(
        events
            .iter()
            .any(|e| e.category == TraceCategory::Process && e.name == "exec")
    );
    assert!(events.iter().any(|e| e.category == TraceCategory::Pipe));

    let summary = kernel.trace_summary();
    assert!(summary.enabled);
    assert_eq!(summary.event_count, events.len());

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"init_status\":0"));
}

#[test]
fn test_invalid_config_rejected() {
    assert!(KernelConfig::from_json(r#"{"max_processes": 1}"#).is_err());
    assert!(KernelConfig::from_json("not json").is_err());

    let config = KernelConfig {
        pipe_buffer_size: 0,
        ..KernelConfig::default()
    };
    assert!(Kernel::new(config).is_err());
}

#[test]
fn test_tracing_enabled_at_runtime() {
    let kernel = Kernel::with_defaults();
    assert!(!kernel.trace_summary().enabled);
    kernel.trace_enable();

    let report = kernel.boot(
        Task::new(|sys, _| async move {
            sys.sleep(2.0).await;
            sys.sleep(3.0).await;
            0
        }),
        &[],
    );

    assert_eq!(report.init_status, Some(0));
    assert_eq!(report.uptime, 5.0);

    let events = kernel.trace_events();
    assert!(
        events
            .iter()
            .any(|e| e.category == TraceCategory::Scheduler && e.name == "boot")
    );
    assert!(kernel.trace_summary().enabled);

    let sched = kernel.scheduler_stats();
    assert!(sched.tick_count > 0);
    assert_eq!(sched.blocked.get(&SchedCause::Io), Some(&2));
    assert_eq!(sched.total_blocked(), 2);
}

#[test]
fn test_stalled_init_is_reported() {
    let (kernel, report) = boot_with(KernelConfig::default(), |sys, _| async move {
        let (r, _w) = sys.pipe().unwrap();
        let mut buf = [0u8; 1];
        // Holds its own writer open, so this never returns
        let _ = sys.read(r, &mut buf).await;
        0
    });

    assert_eq!(report.stalled, 1);
    assert_eq!(report.init_status, None);
    assert_eq!(kernel.process_count(), 2);
}

#[test]
fn test_nested_process_tree() {
    let report = boot(|sys, _| async move {
        let leaf = Task::new(|sys, args| async move {
            sys.sleep(args[0] as f64).await;
            sys.get_ppid().0 as i32
        });
        let branch = Task::new(move |sys, _| {
            let leaf = leaf.clone();
            async move {
                let mut total = 0;
                for delay in [5u8, 1] {
                    sys.exec(&leaf, &[delay]).unwrap();
                }
                while let Ok((_, status)) = sys.wait_child(None).await {
                    total += status;
                }
                total
            }
        });

        let pid = sys.exec(&branch, b"").unwrap();
        let (_, status) = sys.wait_child(Some(pid)).await.unwrap();
        // Both leaves report the branch as their parent
        assert_eq!(status, 2 * pid.0 as i32);
        0
    });

    assert_eq!(report.stats.processes_spawned, 5);
    assert_eq!(report.stats.processes_exited, 4);
}
