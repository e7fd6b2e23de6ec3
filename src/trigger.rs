//! Edge-triggered webhooks.
//!
//! Armed input pins hand their event descriptors to a single epoll set. The
//! [`Dispatcher`] loop waits on it, asks the ready pin which edge happened and
//! sends the configured webhook before waiting again. Delivery is synchronous,
//! so a slow destination holds up every other armed pin until it answers.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use minijinja::value::{Enumerator, Object, Value};
use minijinja::{Environment, context};
use rustc_hash::FxHashMap;

use crate::backend::{Edges, EventSource};
use crate::delivery::Deliver;
use crate::error::GatewayError;
use crate::gateway::PinHandle;
use crate::pin::{Capability, SharedPin};

const MAX_EVENTS: usize = 16;

/// Rendered in place of a pin value that could not be read.
pub const UNREADABLE: &str = "?";

/// The `pin` map seen by payload templates. A pin is read only when a
/// template looks it up.
#[derive(Clone, Default)]
struct PinValues(BTreeMap<String, PinHandle>);

impl fmt::Debug for PinValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl Object for PinValues {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let handle = self.0.get(key.as_str()?)?;
        let value = handle.read().unwrap_or_else(|e| {
            debug!("template read of {key} failed: {e}");
            UNREADABLE.to_string()
        });
        Some(Value::from(value))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.0.keys().map(|k| Value::from(k.as_str())).collect())
    }
}

struct Registration {
    pin: SharedPin,
    name: String,
    on_rising: String,
    on_falling: String,
    method: String,
    template: String,
}

pub struct Dispatcher {
    epoll: OwnedFd,
    registrations: FxHashMap<RawFd, Registration>,
    templates: Environment<'static>,
    pins: PinValues,
}

impl Dispatcher {
    pub fn new() -> Result<Self, GatewayError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(GatewayError::protocol(
                "epoll_create1",
                io::Error::last_os_error(),
            ));
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            registrations: FxHashMap::default(),
            templates: Environment::new(),
            pins: PinValues::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Arms `pin` for the directions that have a destination and adds its
    /// event descriptor to the wait set. An empty URL disables that direction.
    pub fn register(
        &mut self,
        pin: SharedPin,
        on_rising: &str,
        on_falling: &str,
        method: &str,
        payload: &str,
    ) -> Result<(), GatewayError> {
        let mut guard = pin.lock();
        guard.require(Capability::EdgeTrigger)?;
        let name = guard.name().to_string();

        if on_rising.is_empty() && on_falling.is_empty() {
            return Err(GatewayError::Config(format!(
                "{name}: trigger needs a rising or falling destination"
            )));
        }
        if self.registrations.values().any(|r| r.name == name) {
            return Err(GatewayError::Config(format!("{name}: already registered")));
        }

        let template = format!("trigger:{name}");
        self.templates
            .add_template_owned(template.clone(), payload.to_string())
            .map_err(|e| GatewayError::Template(format!("{name}: {e}")))?;

        let source = guard.arm_edges(!on_rising.is_empty(), !on_falling.is_empty())?;
        drop(guard);
        self.watch(source)?;

        info!("Trigger armed on {name} (fd {})", source.fd);
        self.registrations.insert(
            source.fd,
            Registration {
                pin,
                name,
                on_rising: on_rising.to_string(),
                on_falling: on_falling.to_string(),
                method: method.to_string(),
                template,
            },
        );
        Ok(())
    }

    /// Makes `handle` readable from payload templates as `pin["<name>"]`.
    pub fn add_context(&mut self, name: &str, handle: PinHandle) {
        self.pins.0.insert(name.to_string(), handle);
    }

    fn watch(&self, source: EventSource) -> Result<(), GatewayError> {
        let mut event = libc::epoll_event {
            events: source.interest,
            u64: source.fd as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                source.fd,
                &mut event,
            )
        };
        if rc < 0 {
            return Err(GatewayError::protocol(
                "epoll_ctl add",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn unwatch(&self, fd: RawFd) {
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            warn!(
                "Can't drop fd {fd} from wait set: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Waits for events forever. Returns only when the wait itself fails.
    pub fn run<D: Deliver>(&mut self, deliver: &mut D) -> Result<(), GatewayError> {
        info!("Dispatching triggers for {} pins", self.registrations.len());
        loop {
            if let Err(e) = self.wait_once(deliver, None) {
                error!("Trigger dispatcher stopped: {e}");
                return Err(e);
            }
        }
    }

    /// One wait on the set, dispatching whatever became ready. Returns the
    /// number of ready descriptors; an interrupted wait reports zero.
    pub fn wait_once<D: Deliver>(
        &mut self,
        deliver: &mut D,
        timeout: Option<Duration>,
    ) -> Result<usize, GatewayError> {
        let timeout_ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                debug!("epoll_wait interrupted, retrying");
                return Ok(0);
            }
            return Err(GatewayError::protocol("epoll_wait", err));
        }

        let ready = n as usize;
        for event in &events[..ready] {
            let data = event.u64;
            self.dispatch(data as RawFd, deliver);
        }
        Ok(ready)
    }

    fn dispatch<D: Deliver>(&self, fd: RawFd, deliver: &mut D) {
        let Some(registration) = self.registrations.get(&fd) else {
            warn!("Event on unregistered fd {fd}, dropping it from the wait set");
            self.unwatch(fd);
            return;
        };

        let edges = match registration.pin.lock().identify_edge() {
            Ok(edges) => edges,
            Err(e) => {
                warn!("{}: can't read event: {e}", registration.name);
                return;
            }
        };
        if edges.is_none() {
            return;
        }
        debug!("{}: edge {edges:?}", registration.name);

        if edges.rising {
            self.fire(registration, edges, &registration.on_rising, deliver);
        }
        if edges.falling {
            self.fire(registration, edges, &registration.on_falling, deliver);
        }
    }

    fn fire<D: Deliver>(
        &self,
        registration: &Registration,
        edges: Edges,
        url: &str,
        deliver: &mut D,
    ) {
        if url.is_empty() {
            return;
        }
        let body = match self.render(&registration.template, edges) {
            Ok(body) => body,
            Err(e) => {
                warn!("{}: {e}", registration.name);
                return;
            }
        };
        match deliver.deliver(&registration.method, url, body) {
            Ok(status) => debug!(
                "{}: {} {url} -> {status}",
                registration.name, registration.method
            ),
            Err(e) => warn!("{}: {e}", registration.name),
        }
    }

    fn render(&self, template: &str, edges: Edges) -> Result<String, GatewayError> {
        let pins = Value::from_object(self.pins.clone());
        self.templates
            .get_template(template)
            .and_then(|t| {
                t.render(context! {
                    rising_edge => edges.rising,
                    falling_edge => edges.falling,
                    pin => pins,
                })
            })
            .map_err(|e| GatewayError::Template(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::backend::{FakeInjector, FakePin};
    use crate::pin::Pin;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(String, String, String)>,
        fail: bool,
    }

    impl Deliver for Recorder {
        fn deliver(&mut self, method: &str, url: &str, body: String) -> Result<u16, GatewayError> {
            self.calls
                .push((method.to_string(), url.to_string(), body));
            if self.fail {
                Err(GatewayError::Delivery("503 Service Unavailable".into()))
            } else {
                Ok(200)
            }
        }
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(1));

    fn armed(
        dispatcher: &mut Dispatcher,
        name: &str,
        rising: &str,
        falling: &str,
        payload: &str,
    ) -> (SharedPin, FakeInjector) {
        let pin = Pin::Fake(FakePin::new(name, None)).shared();
        dispatcher
            .register(SharedPin::clone(&pin), rising, falling, "POST", payload)
            .unwrap();
        let injector = match &*pin.lock() {
            Pin::Fake(fake) => fake.injector().unwrap(),
            _ => unreachable!(),
        };
        (pin, injector)
    }

    #[test]
    fn edges_go_to_their_destinations() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let (_pin, injector) = armed(
            &mut dispatcher,
            "fakeio-door",
            "http://hub/open",
            "http://hub/closed",
            crate::config::DEFAULT_PAYLOAD,
        );
        let mut recorder = Recorder::default();

        injector.fire().unwrap();
        assert_eq!(dispatcher.wait_once(&mut recorder, WAIT).unwrap(), 1);
        injector.fire().unwrap();
        assert_eq!(dispatcher.wait_once(&mut recorder, WAIT).unwrap(), 1);

        assert_eq!(
            recorder.calls,
            vec![
                ("POST".into(), "http://hub/open".into(), "1".into()),
                ("POST".into(), "http://hub/closed".into(), "0".into()),
            ]
        );
    }

    #[test]
    fn empty_destination_means_no_call() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let (_pin, injector) = armed(&mut dispatcher, "fakeio-bell", "http://hub/ring", "", "x");
        let mut recorder = Recorder::default();

        injector.fire().unwrap();
        dispatcher.wait_once(&mut recorder, WAIT).unwrap();
        injector.fire().unwrap();
        dispatcher.wait_once(&mut recorder, WAIT).unwrap();

        assert_eq!(recorder.calls.len(), 1);
        assert_eq!(recorder.calls[0].1, "http://hub/ring");
    }

    #[test]
    fn unregistered_descriptor_does_not_stop_the_loop() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let (_pin, injector) = armed(&mut dispatcher, "fakeio-a", "http://hub/a", "", "up");

        let (stray, mut stray_writer) = UnixStream::pair().unwrap();
        dispatcher
            .watch(EventSource {
                fd: stray.as_raw_fd(),
                interest: libc::EPOLLIN as u32,
            })
            .unwrap();
        stray_writer.write_all(&[1]).unwrap();

        let mut recorder = Recorder::default();
        assert_eq!(dispatcher.wait_once(&mut recorder, WAIT).unwrap(), 1);
        assert!(recorder.calls.is_empty());

        injector.fire().unwrap();
        assert_eq!(dispatcher.wait_once(&mut recorder, WAIT).unwrap(), 1);
        assert_eq!(recorder.calls.len(), 1);
        assert_eq!(recorder.calls[0].2, "up");
    }

    #[test]
    fn delivery_failure_is_not_fatal() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let (_pin, injector) =
            armed(&mut dispatcher, "fakeio-b", "http://hub/b", "http://hub/b", "v");
        let mut recorder = Recorder {
            fail: true,
            ..Recorder::default()
        };

        injector.fire().unwrap();
        dispatcher.wait_once(&mut recorder, WAIT).unwrap();
        injector.fire().unwrap();
        dispatcher.wait_once(&mut recorder, WAIT).unwrap();
        assert_eq!(recorder.calls.len(), 2);
    }

    #[test]
    fn template_syntax_errors_fail_registration() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let pin = Pin::Fake(FakePin::new("fakeio-c", None)).shared();
        let err = dispatcher
            .register(pin, "http://hub/c", "", "PUT", "{% if rising_edge %}open")
            .unwrap_err();
        assert!(matches!(err, GatewayError::Template(_)));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn trigger_needs_a_destination() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let pin = Pin::Fake(FakePin::new("fakeio-d", None)).shared();
        let err = dispatcher.register(pin, "", "", "PUT", "x").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn a_pin_registers_once() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let (pin, _injector) = armed(&mut dispatcher, "fakeio-e", "http://hub/e", "", "x");
        assert!(dispatcher.register(pin, "http://hub/e", "", "PUT", "x").is_err());
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn templates_see_other_pins() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let mut relay = FakePin::new("fakeio-relay", None);
        relay.set_output().unwrap();
        relay.write_bool(true).unwrap();
        dispatcher.add_context("fakeio-relay", PinHandle::Direct(Pin::Fake(relay).shared()));

        let (pin, injector) = armed(
            &mut dispatcher,
            "fakeio-button",
            "http://hub/press",
            "",
            r#"relay={{ pin["fakeio-relay"] }} missing={{ pin["fakeio-none"] is defined }}"#,
        );
        dispatcher.add_context("fakeio-button", PinHandle::Direct(pin));
        let mut recorder = Recorder::default();

        injector.fire().unwrap();
        dispatcher.wait_once(&mut recorder, WAIT).unwrap();
        assert_eq!(recorder.calls[0].2, "relay=1 missing=false");
    }

    #[test]
    fn pins_are_read_only_when_a_template_uses_them() {
        use std::sync::atomic::Ordering;

        let mut dispatcher = Dispatcher::new().unwrap();
        let level = FakePin::new("fakeio-level", None);
        let reads = level.read_count();
        dispatcher.add_context("fakeio-level", PinHandle::Direct(Pin::Fake(level).shared()));

        let (_quiet, quiet) = armed(
            &mut dispatcher,
            "fakeio-quiet",
            "http://hub/quiet",
            "",
            crate::config::DEFAULT_PAYLOAD,
        );
        let (_loud, loud) = armed(
            &mut dispatcher,
            "fakeio-loud",
            "http://hub/loud",
            "",
            r#"{{ pin["fakeio-level"] }}"#,
        );
        let mut recorder = Recorder::default();

        quiet.fire().unwrap();
        dispatcher.wait_once(&mut recorder, WAIT).unwrap();
        assert_eq!(reads.load(Ordering::Relaxed), 0);

        loud.fire().unwrap();
        dispatcher.wait_once(&mut recorder, WAIT).unwrap();
        assert_eq!(reads.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.calls[1].2, "0");
    }

    #[test]
    fn unreadable_pins_render_a_placeholder() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("gpio5");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("value"), "garbage\n").unwrap();
        let registry = crate::registry::Registry::new(crate::config::HardwareConfig {
            sysfs_root: dir.path().to_path_buf(),
            ..crate::config::HardwareConfig::default()
        });

        let mut dispatcher = Dispatcher::new().unwrap();
        let sensor = Pin::create("gpio5", &registry).unwrap().shared();
        dispatcher.add_context("gpio5", PinHandle::Direct(sensor));
        dispatcher
            .templates
            .add_template("listing", r#"{% for name in pin %}{{ name }}={{ pin[name] }}{% endfor %}"#)
            .unwrap();

        let body = dispatcher.render("listing", Edges::RISING).unwrap();
        assert_eq!(body, format!("gpio5={UNREADABLE}"));
    }

    #[test]
    fn idle_wait_times_out() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let mut recorder = Recorder::default();
        let n = dispatcher
            .wait_once(&mut recorder, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }
}
