mod common;

use common::*;
use matches::assert_matches;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rusty_fork::*;
use std::fs;
use std::thread;
use std::time::Duration;
use zellkern::configuration::SpawnMethod;
use zellkern::dispatcher::{Dispatcher, SpawnServer};
use zellkern::error::SpawnError;
use zellkern::spawner::protocol::{receive_spawn_reply, SpawnRequest};
use zellkern::spawner::SpawnOptions;
use zellkern::worker::SupervisedWorker;

fn framework_app(version: &str) -> SpawnOptions {
    let root = scratch_dir("fw-app");
    fs::write(root.join("framework"), version).unwrap();
    SpawnOptions::new(root)
}

fn plain_app() -> SpawnOptions {
    SpawnOptions::new(scratch_dir("app"))
}

fn preloaded_by(dispatcher: &Dispatcher, options: &SpawnOptions) -> u32 {
    let worker = dispatcher.spawn_application(options).unwrap();
    loaded_by(&request(&worker, "/", ""))
}

rusty_fork_test! {
    #[test]
    fn smart_spawning_shares_preloaders() {
        let dispatcher = Dispatcher::new(hosting(PidLoader, SpawnMethod::Smart));
        let framework = framework_app("2.0");
        let plain = plain_app();

        let fw_preloader = preloaded_by(&dispatcher, &framework);
        assert_eq!(preloaded_by(&dispatcher, &framework), fw_preloader);
        let plain_preloader = preloaded_by(&dispatcher, &plain);
        assert_eq!(preloaded_by(&dispatcher, &plain), plain_preloader);
        assert_ne!(fw_preloader, plain_preloader);

        dispatcher.reload(Some(framework.app_root.as_path()));
        assert_ne!(preloaded_by(&dispatcher, &framework), fw_preloader);
        assert_eq!(preloaded_by(&dispatcher, &plain), plain_preloader);

        dispatcher.reload(None);
        assert_ne!(preloaded_by(&dispatcher, &plain), plain_preloader);
        dispatcher.shutdown();
    }

    #[test]
    fn conservative_spawning_loads_every_time() {
        let dispatcher = Dispatcher::new(hosting(PidLoader, SpawnMethod::Conservative));
        let options = framework_app("2.0");
        let worker = dispatcher.spawn_application(&options).unwrap();
        assert_eq!(loaded_by(&request(&worker, "/", "")), worker.pid.as_raw() as u32);
    }

    #[test]
    fn dead_preloaders_are_replaced() {
        let dispatcher = Dispatcher::new(hosting(PidLoader, SpawnMethod::SmartLv2));
        let options = plain_app();
        let preloader = preloaded_by(&dispatcher, &options);
        kill(Pid::from_raw(preloader as i32), Signal::SIGKILL).unwrap();

        let result = dispatcher.spawn_application(&options);
        assert!(result.as_ref().err().map_or(false, SpawnError::is_unavailable), "{:?}", result);
        assert_ne!(preloaded_by(&dispatcher, &options), preloader);
    }

    #[test]
    fn invalid_roots_are_refused() {
        let dispatcher = Dispatcher::new(hosting(PidLoader, SpawnMethod::Smart));
        assert_matches!(
            dispatcher.spawn_application(&SpawnOptions::new("/nonexistent/zellkern/app")),
            Err(SpawnError::InvalidAppRoot { .. })
        );
        let file = scratch_dir("file").join("not-a-dir");
        fs::write(&file, "").unwrap();
        assert_matches!(
            dispatcher.spawn_application(&SpawnOptions::new(file)),
            Err(SpawnError::InvalidAppRoot { .. })
        );
    }

    #[test]
    fn spawn_server_answers_over_its_channel() {
        let mut server = SupervisedWorker::new(SpawnServer::new(hosting(PidLoader, SpawnMethod::SmartLv2)));
        server.start().unwrap();
        let options = plain_app();

        let spawn = SpawnRequest::SpawnApplication(options.clone()).to_message();
        server.send(&spawn).unwrap();
        let worker = receive_spawn_reply(server.channel().unwrap(), &options.app_root, "spawn server").unwrap();
        let first = loaded_by(&request(&worker, "/", ""));

        server.send(&SpawnRequest::Reload(None).to_message()).unwrap();
        server.send(&spawn).unwrap();
        let worker = receive_spawn_reply(server.channel().unwrap(), &options.app_root, "spawn server").unwrap();
        assert_ne!(loaded_by(&request(&worker, "/", "")), first);

        let missing = SpawnRequest::SpawnApplication(SpawnOptions::new("/nonexistent/zellkern/app"));
        server.send(&missing.to_message()).unwrap();
        assert_matches!(
            receive_spawn_reply(server.channel().unwrap(), &options.app_root, "spawn server"),
            Err(SpawnError::InvalidAppRoot { .. })
        );

        server.stop().unwrap();
    }

    #[test]
    fn spawn_requests_can_shorten_spawner_idle_times() {
        let dispatcher = Dispatcher::new(hosting(PidLoader, SpawnMethod::Smart));
        let impatient = plain_app().with_app_spawner_timeout(Duration::from_secs(1));
        let framework = framework_app("3.0").with_framework_spawner_timeout(Duration::from_secs(1));
        let patient = plain_app();

        let impatient_preloader = preloaded_by(&dispatcher, &impatient);
        let framework_preloader = preloaded_by(&dispatcher, &framework);
        let patient_preloader = preloaded_by(&dispatcher, &patient);
        thread::sleep(Duration::from_millis(1500));

        assert_ne!(preloaded_by(&dispatcher, &impatient), impatient_preloader);
        assert_ne!(preloaded_by(&dispatcher, &framework), framework_preloader);
        assert_eq!(preloaded_by(&dispatcher, &patient), patient_preloader);
    }

    #[test]
    fn sighup_makes_the_spawn_server_reload() {
        let mut server = SupervisedWorker::new(SpawnServer::new(hosting(PidLoader, SpawnMethod::SmartLv2)));
        let server_pid = server.start().unwrap();
        let options = plain_app();
        let spawn = SpawnRequest::SpawnApplication(options.clone()).to_message();
        let preloader = |server: &mut SupervisedWorker<SpawnServer>| {
            server.send(&spawn).unwrap();
            let worker = receive_spawn_reply(server.channel().unwrap(), &options.app_root, "spawn server").unwrap();
            loaded_by(&request(&worker, "/", ""))
        };

        let first = preloader(&mut server);
        assert_eq!(preloader(&mut server), first);
        kill(server_pid, Signal::SIGHUP).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_ne!(preloader(&mut server), first);
        assert!(server.is_running());
        server.stop().unwrap();
    }
}
