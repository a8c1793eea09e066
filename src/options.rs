//! Named configuration mutators, applied to a default [`Config`] in call
//! order.

use std::time::Duration;

use crate::config::Config;

pub type DatabaseOption = Box<dyn FnOnce(&mut Config) + Send>;

pub fn with_max_conn_lifetime(lifetime: Duration) -> DatabaseOption {
    Box::new(move |conf| conf.max_lifetime = lifetime)
}

pub fn with_max_open_conns(limit: usize) -> DatabaseOption {
    Box::new(move |conf| conf.max_open_conns = limit)
}

pub fn with_max_idle_conns(limit: usize) -> DatabaseOption {
    Box::new(move |conf| conf.max_idle_conns = limit)
}

pub fn with_dial_timeout(timeout: Duration) -> DatabaseOption {
    Box::new(move |conf| conf.params.dial_timeout = timeout)
}

pub fn with_read_timeout(timeout: Duration) -> DatabaseOption {
    Box::new(move |conf| conf.params.read_timeout = timeout)
}

pub fn with_write_timeout(timeout: Duration) -> DatabaseOption {
    Box::new(move |conf| conf.params.write_timeout = timeout)
}

pub fn with_busy_timeout(timeout: Duration) -> DatabaseOption {
    Box::new(move |conf| conf.params.busy_timeout = timeout)
}

pub fn with_ping_on_startup(ping: bool) -> DatabaseOption {
    Box::new(move |conf| conf.ping_on_startup = ping)
}
