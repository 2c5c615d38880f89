use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

pub fn start(name: &'static str, func: impl FnOnce() + Send + 'static) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            set_name(name);
            func()
        })
        .expect("spawning thread")
}

pub fn set_name(name: &str) {
    let Ok(cstr) = CString::new(name) else { return };

    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), cstr.as_ptr());
    }
}

/// Ask the OS for realtime scheduling on the calling thread. Failure is
/// expected when running unprivileged, warn once and carry on.
pub fn set_realtime_priority() {
    let param = libc::sched_param { sched_priority: 99 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };

    if rc < 0 {
        static WARNED: AtomicBool = AtomicBool::new(false);
        if !WARNED.swap(true, Ordering::Relaxed) {
            let err = std::io::Error::last_os_error();
            log::warn!("failed to set realtime thread priority: {err}");
        }
    }
}
