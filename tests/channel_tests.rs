mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use pinwire::channel::{ChannelOptions, ChannelState, CommandChannel};
use pinwire::error::AppError;
use pinwire::packet::{self, BackendCode, Command, FRAME_SIZE, Packet};

use common::FakeDaemon;

/// Accept one connection and hand it to `script`.
fn serve_once(script: impl FnOnce(TcpStream) + Send + 'static) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("address");
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            script(stream);
        }
    });
    addr
}

#[test]
fn command_returns_daemon_result() {
    let daemon = FakeDaemon::spawn(|req| req.p1 * 10);
    let channel = CommandChannel::connect(daemon.addr, ChannelOptions::default()).unwrap();

    assert_eq!(channel.command(Command::Read, 4, 0, 0).unwrap(), 40);

    let response = channel.send(&Packet::request(Command::Write, 17, 1)).unwrap();
    assert_eq!(response.command, Command::Write);
    assert_eq!((response.p1, response.p2, response.p3), (17, 1, 170));
    assert_eq!(channel.state(), ChannelState::Open);
}

#[test]
fn negative_result_is_backend_error() {
    let daemon = FakeDaemon::spawn(|_| BackendCode::BAD_GPIO.0);
    let channel = CommandChannel::connect(daemon.addr, ChannelOptions::default()).unwrap();

    let err = channel.command(Command::Read, 99, 0, 0).unwrap_err();
    match err {
        AppError::Backend { command, code } => {
            assert_eq!(command, Command::Read);
            assert_eq!(code, BackendCode::BAD_GPIO);
        }
        other => panic!("unexpected error {other}"),
    }
    // a refusal is not a transport failure
    assert_eq!(channel.state(), ChannelState::Open);
    assert!(matches!(
        channel.command(Command::Read, 3, 0, 0),
        Err(AppError::Backend { .. })
    ));
}

#[test]
fn response_split_across_reads_is_reassembled() {
    let addr = serve_once(|mut stream| {
        let mut frame = [0u8; FRAME_SIZE];
        stream.read_exact(&mut frame).unwrap();
        let response = Packet::new(Command::Read, 5, 0, 1).to_bytes();
        for chunk in response.chunks(3) {
            stream.write_all(chunk).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(200));
    });
    let channel = CommandChannel::connect(addr, ChannelOptions::default()).unwrap();

    assert_eq!(channel.command(Command::Read, 5, 0, 0).unwrap(), 1);
}

#[test]
fn concurrent_callers_get_their_own_responses() {
    let daemon = FakeDaemon::spawn(|req| req.p1);
    let channel =
        Arc::new(CommandChannel::connect(daemon.addr, ChannelOptions::default()).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let channel = channel.clone();
            thread::spawn(move || {
                for round in 0..25 {
                    let tag = worker * 1000 + round;
                    assert_eq!(channel.command(Command::Read, tag, 0, 0).unwrap(), tag);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(daemon.requests().len(), 200);
}

#[test]
fn short_response_closes_channel() {
    let addr = serve_once(|mut stream| {
        let mut frame = [0u8; FRAME_SIZE];
        stream.read_exact(&mut frame).unwrap();
        stream.write_all(&[3, 0, 0, 0, 4, 0, 0]).unwrap();
    });
    let channel = CommandChannel::connect(addr, ChannelOptions::default()).unwrap();

    let err = channel.command(Command::Read, 4, 0, 0).unwrap_err();
    assert!(matches!(err, AppError::Transport(_)), "{err}");
    assert_eq!(channel.state(), ChannelState::Closed);

    let err = channel.command(Command::Read, 4, 0, 0).unwrap_err();
    assert!(matches!(err, AppError::Transport(_)), "{err}");
}

#[test]
fn silent_daemon_hits_response_timeout() {
    let addr = serve_once(|mut stream| {
        let mut frame = [0u8; FRAME_SIZE];
        let _ = stream.read_exact(&mut frame);
        thread::sleep(Duration::from_secs(2));
    });
    let options = ChannelOptions {
        response_timeout: Some(Duration::from_millis(100)),
        ..ChannelOptions::default()
    };
    let channel = CommandChannel::connect(addr, options).unwrap();

    let started = Instant::now();
    let err = channel.command(Command::Read, 4, 0, 0).unwrap_err();
    assert!(matches!(err, AppError::Transport(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[test]
fn failed_round_trip_never_leaks_into_queued_caller() {
    let (seen_tx, seen_rx) = mpsc::channel();
    let addr = serve_once(move |mut stream| {
        let mut frame = [0u8; FRAME_SIZE];
        stream.read_exact(&mut frame).unwrap();
        let first = Packet::new(Command::Read, 1, 0, 1).to_bytes();
        stream.write_all(&first[..8]).unwrap();

        // only answer a second request if one ever arrives
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        if stream.read_exact(&mut frame).is_ok() {
            let second = packet::decode(&frame).unwrap();
            seen_tx.send(second).unwrap();
            let _ = stream.write_all(&first[8..]);
            let _ = stream.write_all(&Packet::new(second.command, second.p1, 0, 2).to_bytes());
        }
        thread::sleep(Duration::from_millis(200));
    });
    let options = ChannelOptions {
        response_timeout: Some(Duration::from_millis(100)),
        ..ChannelOptions::default()
    };
    let channel = Arc::new(CommandChannel::connect(addr, options).unwrap());

    let first = {
        let channel = channel.clone();
        thread::spawn(move || channel.send(&Packet::request(Command::Read, 1, 0)))
    };
    thread::sleep(Duration::from_millis(20));
    let second = {
        let channel = channel.clone();
        thread::spawn(move || channel.send(&Packet::request(Command::SetMode, 111, 3)))
    };

    let first = first.join().unwrap();
    let second = second.join().unwrap();

    assert!(matches!(first, Err(AppError::Transport(_))), "{first:?}");
    assert!(matches!(second, Err(AppError::Transport(_))), "{second:?}");
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(
        seen_rx.recv_timeout(Duration::from_secs(1)).is_err(),
        "queued request reached the daemon after the channel failed"
    );
}

#[test]
fn close_is_idempotent() {
    let daemon = FakeDaemon::spawn(|_| 0);
    let channel = CommandChannel::connect(daemon.addr, ChannelOptions::default()).unwrap();

    channel.close();
    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);

    let err = channel.send(&Packet::request(Command::Tick, 0, 0)).unwrap_err();
    assert!(matches!(err, AppError::Transport(_)), "{err}");
    assert!(daemon.requests().is_empty());
}

#[test]
fn close_unblocks_send_in_flight() {
    let addr = serve_once(|mut stream| {
        let mut frame = [0u8; FRAME_SIZE];
        let _ = stream.read_exact(&mut frame);
        thread::sleep(Duration::from_secs(5));
    });
    let options = ChannelOptions {
        response_timeout: None,
        ..ChannelOptions::default()
    };
    let channel = Arc::new(CommandChannel::connect(addr, options).unwrap());

    let sender = {
        let channel = channel.clone();
        thread::spawn(move || channel.command(Command::Read, 4, 0, 0))
    };
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    channel.close();
    let result = sender.join().unwrap();

    assert!(matches!(result, Err(AppError::Transport(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn connect_refused_is_connect_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let Err(err) = CommandChannel::connect(addr, ChannelOptions::default()) else {
        panic!("connected to a closed port");
    };
    assert!(matches!(err, AppError::Connect(_)), "{err}");
}
