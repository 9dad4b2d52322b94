//! Diagnostic delivery.
//!
//! Callers install per-severity callbacks; the codec itself never prints.
//! Messages are mirrored to the `log` facade so embedders that only
//! configure a logger still see them.

use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
  Info,
  Warning,
  Error,
}

pub const EVT_INFO: EventType = EventType::Info;
pub const EVT_WARNING: EventType = EventType::Warning;
pub const EVT_ERROR: EventType = EventType::Error;

type Handler = Rc<dyn Fn(&str)>;

/// Event manager: owns the optional callbacks for each severity.
#[derive(Default, Clone)]
pub struct Events {
  info: Option<Handler>,
  warning: Option<Handler>,
  error: Option<Handler>,
}

impl fmt::Debug for Events {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Events")
      .field("info", &self.info.is_some())
      .field("warning", &self.warning.is_some())
      .field("error", &self.error.is_some())
      .finish()
  }
}

impl Events {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_info_handler(&mut self, handler: impl Fn(&str) + 'static) {
    self.info = Some(Rc::new(handler));
  }

  pub fn set_warning_handler(&mut self, handler: impl Fn(&str) + 'static) {
    self.warning = Some(Rc::new(handler));
  }

  pub fn set_error_handler(&mut self, handler: impl Fn(&str) + 'static) {
    self.error = Some(Rc::new(handler));
  }

  pub fn msg_write(&self, event_type: EventType, msg: &str) {
    let handler = match event_type {
      EventType::Info => {
        log::info!("{}", msg);
        &self.info
      }
      EventType::Warning => {
        log::warn!("{}", msg);
        &self.warning
      }
      EventType::Error => {
        log::error!("{}", msg);
        &self.error
      }
    };
    if let Some(handler) = handler {
      handler(msg);
    }
  }
}

macro_rules! event_msg {
  ($events:expr, $event_type:expr, $fmt:expr) => {
    $events.msg_write($event_type, $fmt)
  };
  ($events:expr, $event_type:expr, $fmt:expr, $($arg:tt)*) => {
    $events.msg_write($event_type, &format!($fmt, $($arg)*))
  };
}
