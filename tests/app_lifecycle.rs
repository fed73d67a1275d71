//! Application controller lifecycle: graceful shutdown from a periodic
//! countdown, control-signal delivery, and start synchronisation.
//!
//! Everything lives in one test: the controller is process-global (signal
//! dispositions, main loop), so it is initialized exactly once here.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use keel::app::{Application, ControlSignal};
use keel::timers::PeriodicalTimer;
use keel::{MsgFramer, Server};

#[test]
fn application_graceful_shutdown() {
    keel::logging::init();

    let app = Application::init(Application::configure());
    assert!(!app.is_running());

    let (control_tx, control_rx) = mpsc::channel();
    app.on_control(move |signal| control_tx.send(signal).unwrap());

    let server_slot: Arc<Mutex<Option<Server>>> = Arc::new(Mutex::new(None));
    let timer_slot: Arc<Mutex<Option<PeriodicalTimer>>> = Arc::new(Mutex::new(None));
    let countdown = Arc::new(AtomicI32::new(5));
    let exited = Arc::new(AtomicBool::new(false));

    let start_server_slot = server_slot.clone();
    let start_timer_slot = timer_slot.clone();
    let start_countdown = countdown.clone();
    app.on_start(move || {
        assert!(Application::instance().main_loop().is_this_loop());

        // Bring a server up for the lifetime of the application.
        let mut server = Server::new();
        server
            .start(
                Server::configure_tcp()
                    .address("127.0.0.1", 0)
                    .protocol(MsgFramer::new()),
            )
            .unwrap();
        assert!(server.wait());
        *start_server_slot.lock().unwrap() = Some(server);

        // Poke ourselves with a control signal while running.
        // SAFETY: raising a handled, non-fatal signal at ourselves.
        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        // The countdown drives the shutdown.
        let counter = start_countdown.clone();
        let timer = Application::instance()
            .main_loop()
            .repeat(Duration::from_millis(20), move || {
                if counter.fetch_sub(1, Ordering::SeqCst) - 1 == 0 {
                    Application::instance().stop(0);
                }
            });
        *start_timer_slot.lock().unwrap() = Some(timer);
    });

    let exit_server_slot = server_slot.clone();
    let exit_flag = exited.clone();
    app.on_exit(move |signo| {
        assert_eq!(signo, 0, "programmatic stop reports signal 0");
        if let Some(mut server) = exit_server_slot.lock().unwrap().take() {
            server.stop(true);
            assert_eq!(server.connection_count(), 0);
        }
        exit_flag.store(true, Ordering::SeqCst);
    });

    // wait() unblocks once the start sequence completed on the main loop.
    let app_probe = app;
    let waited = std::thread::spawn(move || {
        app_probe.wait();
    });

    let code = app.run();
    assert_eq!(code, 0);
    waited.join().unwrap();

    assert!(exited.load(Ordering::SeqCst));
    assert_eq!(countdown.load(Ordering::SeqCst), 0);
    assert!(!app.is_running());
    assert!(server_slot.lock().unwrap().is_none());

    // The control callback ran on the main loop before shutdown.
    let signal = control_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("control signal was delivered");
    assert_eq!(signal, ControlSignal::Usr1);
}
