use std::thread;

/// Spawns a worker with a diagnostic thread name.
///
/// Every background worker here belongs to some resource, and the name says
/// which one: `pty-reader-web`, `stop-watchdog-db`, `ipc-client-3`. Those
/// names surface in panic messages and debuggers, which is what makes a
/// twelve-thread supervisor debuggable.
pub fn spawn_named_thread<F, T>(name: impl Into<String>, f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .unwrap_or_else(|err| panic!("could not spawn worker thread `{name}`: {err}"))
}
