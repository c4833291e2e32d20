//! The data model the client exposes to its server: objects, object
//! instances, resources and resource instances addressed by short
//! numeric URI paths (`/3/0/1` is object 3, instance 0, resource 1;
//! a fourth segment picks one instance of a multi-instance resource).
//!
//! Hosts implement [`ObjectHandler`] per object and register handlers in
//! a [`Registry`]; inbound server requests are routed to them by path,
//! with write-ish operations wrapped in a transaction so a handler can
//! validate and roll back.

use core::fmt;

use coap_lite::{MessageClass, Packet, RequestType};
use log::{debug, warn};

use crate::msg;

/// Errors a data-model operation can produce. Each maps 1:1 to the CoAP
/// response code reported to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DmError {
  /// 4.00
  BadRequest,
  /// 4.01
  Unauthorized,
  /// 4.04
  NotFound,
  /// 4.05
  MethodNotAllowed,
  /// 4.06
  NotAcceptable,
  /// 5.00
  Internal,
  /// 5.01; also the default for every [`ObjectHandler`] operation a
  /// handler chooses not to implement
  NotImplemented,
  /// 5.03
  ServiceUnavailable,
}

impl DmError {
  /// The CoAP response code this error is reported as
  pub fn code(&self) -> MessageClass {
    match self {
      | Self::BadRequest => msg::code(4, 0),
      | Self::Unauthorized => msg::code(4, 1),
      | Self::NotFound => msg::code(4, 4),
      | Self::MethodNotAllowed => msg::code(4, 5),
      | Self::NotAcceptable => msg::code(4, 6),
      | Self::Internal => msg::code(5, 0),
      | Self::NotImplemented => msg::code(5, 1),
      | Self::ServiceUnavailable => msg::code(5, 3),
    }
  }
}

impl fmt::Display for DmError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let (class, detail) = msg::class_detail(self.code());
    write!(f, "{:?} ({}.{:02})", self, class, detail)
  }
}

/// Result of a data-model operation
pub type DmResult<T> = Result<T, DmError>;

/// A parsed data-model path:
/// `object[/instance[/resource[/resource-instance]]]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
  /// Object ID
  pub object: u16,
  /// Object instance, absent when the path addresses the whole object
  pub instance: Option<u16>,
  /// Resource, absent when the path addresses an instance
  pub resource: Option<u16>,
  /// Instance of a multi-instance resource, absent when the path
  /// addresses the whole resource
  pub resource_instance: Option<u16>,
}

impl Path {
  /// Address a whole object
  pub fn object(object: u16) -> Self {
    Self { object,
           instance: None,
           resource: None,
           resource_instance: None }
  }

  /// Address an object instance
  pub fn instance(object: u16, instance: u16) -> Self {
    Self { object,
           instance: Some(instance),
           resource: None,
           resource_instance: None }
  }

  /// Address a single resource
  pub fn resource(object: u16, instance: u16, resource: u16) -> Self {
    Self { object,
           instance: Some(instance),
           resource: Some(resource),
           resource_instance: None }
  }

  /// Address one instance of a multi-instance resource
  pub fn resource_instance(object: u16,
                           instance: u16,
                           resource: u16,
                           resource_instance: u16)
                           -> Self {
    Self { object,
           instance: Some(instance),
           resource: Some(resource),
           resource_instance: Some(resource_instance) }
  }

  /// Parse a slash-separated numeric path.
  ///
  /// ```
  /// use newt::dm::Path;
  ///
  /// assert_eq!(Path::parse("3/0/1"), Ok(Path::resource(3, 0, 1)));
  /// assert_eq!(Path::parse("3/0/6/1"), Ok(Path::resource_instance(3, 0, 6, 1)));
  /// assert_eq!(Path::parse("/3"), Ok(Path::object(3)));
  /// assert!(Path::parse("3/0/1/2/3").is_err());
  /// assert!(Path::parse("frogs").is_err());
  /// ```
  pub fn parse(s: &str) -> DmResult<Self> {
    let mut ids = s.split('/')
                   .filter(|seg| !seg.is_empty())
                   .map(|seg| seg.parse::<u16>().map_err(|_| DmError::BadRequest));

    let object = ids.next().ok_or(DmError::BadRequest)??;
    let instance = ids.next().transpose()?;
    let resource = ids.next().transpose()?;
    let resource_instance = ids.next().transpose()?;

    if ids.next().is_some() {
      return Err(DmError::BadRequest);
    }

    Ok(Self { object,
              instance,
              resource,
              resource_instance })
  }
}

impl fmt::Display for Path {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.object)?;
    if let Some(i) = self.instance {
      write!(f, "/{}", i)?;
    }
    if let Some(r) = self.resource {
      write!(f, "/{}", r)?;
    }
    if let Some(ri) = self.resource_instance {
      write!(f, "/{}", ri)?;
    }
    Ok(())
  }
}

/// One object of the data model, implemented by the host.
///
/// Every operation defaults to [`DmError::NotImplemented`] so a
/// handler only writes the ones its object supports. Values cross this
/// boundary as opaque bytes; content formats are between the host and
/// its server.
pub trait ObjectHandler {
  /// The object ID this handler serves
  fn object_id(&self) -> u16;

  /// Instances that currently exist, in ascending order. Drives the
  /// registration payload.
  fn instances(&self) -> Vec<u16> {
    vec![0]
  }

  /// Read a resource (or a whole instance when `path.resource` is
  /// absent)
  fn read(&mut self, path: &Path) -> DmResult<Vec<u8>> {
    let _ = path;
    Err(DmError::NotImplemented)
  }

  /// Overwrite a resource or instance
  fn write(&mut self, path: &Path, value: &[u8]) -> DmResult<()> {
    let _ = (path, value);
    Err(DmError::NotImplemented)
  }

  /// Execute a resource
  fn execute(&mut self, path: &Path, args: &[u8]) -> DmResult<()> {
    let _ = (path, args);
    Err(DmError::NotImplemented)
  }

  /// Create an object instance
  fn create(&mut self, instance: u16, value: &[u8]) -> DmResult<()> {
    let _ = (instance, value);
    Err(DmError::NotImplemented)
  }

  /// Delete an object instance
  fn delete(&mut self, instance: u16) -> DmResult<()> {
    let _ = instance;
    Err(DmError::NotImplemented)
  }

  /// Create one instance of a multi-instance resource.
  /// `path.resource_instance` names the new instance.
  fn create_resource_instance(&mut self, path: &Path, value: &[u8]) -> DmResult<()> {
    let _ = (path, value);
    Err(DmError::NotImplemented)
  }

  /// Delete one instance of a multi-instance resource
  fn delete_resource_instance(&mut self, path: &Path) -> DmResult<()> {
    let _ = path;
    Err(DmError::NotImplemented)
  }

  /// Restore an instance's resources to their defaults. Runs ahead of
  /// the write when a whole instance is replaced.
  fn reset(&mut self, instance: u16) -> DmResult<()> {
    let _ = instance;
    Err(DmError::NotImplemented)
  }

  /// A mutation is about to happen; snapshot whatever rollback needs
  fn transaction_begin(&mut self) {}

  /// The mutation has been applied but not yet committed; reject it by
  /// returning an error
  fn transaction_validate(&mut self) -> DmResult<()> {
    Ok(())
  }

  /// The transaction is over. `committed` is false when the operation
  /// or validation failed and the handler should restore its snapshot.
  fn transaction_end(&mut self, committed: bool) {
    let _ = committed;
  }
}

/// The set of objects the client exposes, keyed by object ID.
pub struct Registry {
  handlers: Vec<Box<dyn ObjectHandler>>,
}

impl fmt::Debug for Registry {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Registry")
     .field("objects",
            &self.handlers.iter().map(|h| h.object_id()).collect::<Vec<_>>())
     .finish()
  }
}

impl Default for Registry {
  fn default() -> Self {
    Self::new()
  }
}

impl Registry {
  /// An empty registry
  pub fn new() -> Self {
    Self { handlers: vec![] }
  }

  /// Expose an object. A handler for the same object ID replaces the
  /// previous one.
  pub fn add(&mut self, handler: Box<dyn ObjectHandler>) {
    self.handlers.retain(|h| h.object_id() != handler.object_id());
    self.handlers.push(handler);
    self.handlers.sort_by_key(|h| h.object_id());
  }

  fn handler_mut(&mut self, object: u16) -> DmResult<&mut Box<dyn ObjectHandler>> {
    self.handlers
        .iter_mut()
        .find(|h| h.object_id() == object)
        .ok_or(DmError::NotFound)
  }

  /// Read the value at `path`, for the host's own use (notifications)
  pub fn read(&mut self, path: &Path) -> DmResult<Vec<u8>> {
    let path = *path;
    self.handler_mut(path.object)?.read(&path)
  }

  /// The CoRE link-format registration payload describing every
  /// object instance, e.g. `</1/0>,</3/0>`.
  pub fn link_format(&self) -> String {
    self.handlers
        .iter()
        .flat_map(|h| {
          let object = h.object_id();
          h.instances()
           .into_iter()
           .map(move |i| format!("</{}/{}>", object, i))
        })
        .collect::<Vec<_>>()
        .join(",")
  }

  /// Route an inbound server request to the addressed handler and build
  /// the response. Never fails: data-model errors become their CoAP
  /// response codes.
  pub fn dispatch(&mut self, req: &Packet) -> Packet {
    let method = match req.header.code {
      | MessageClass::Request(m) => m,
      | _ => return msg::response_for(req, msg::code(4, 0)),
    };

    match self.dispatch_inner(method, req) {
      | Ok(rep) => rep,
      | Err(e) => {
        debug!("{:?} {} -> {}", method, msg::uri_path(req), e);
        msg::response_for(req, e.code())
      },
    }
  }

  fn dispatch_inner(&mut self, method: RequestType, req: &Packet) -> DmResult<Packet> {
    let path = Path::parse(&msg::uri_path(req))?;

    match method {
      | RequestType::Get => {
        let value = self.handler_mut(path.object)?.read(&path)?;
        let mut rep = msg::response_for(req, msg::code(2, 5));
        rep.payload = value;
        Ok(rep)
      },

      | RequestType::Put => {
        let handler = self.handler_mut(path.object)?;
        in_transaction(handler.as_mut(), |h| {
          // replacing a whole instance restores defaults first
          if let (Some(instance), None) = (path.instance, path.resource) {
            h.reset(instance)?;
          }
          h.write(&path, &req.payload)
        })?;
        Ok(msg::response_for(req, msg::code(2, 4)))
      },

      | RequestType::Post => match (path.instance, path.resource, path.resource_instance) {
        // POST on a resource instance creates it
        | (Some(_), Some(_), Some(_)) => {
          let handler = self.handler_mut(path.object)?;
          in_transaction(handler.as_mut(),
                         |h| h.create_resource_instance(&path, &req.payload))?;
          Ok(msg::response_for(req, msg::code(2, 1)))
        },
        // POST on a resource executes it
        | (Some(_), Some(_), None) => {
          self.handler_mut(path.object)?.execute(&path, &req.payload)?;
          Ok(msg::response_for(req, msg::code(2, 4)))
        },
        // POST on an instance (or the object itself) creates
        | (instance, None, None) => {
          let handler = self.handler_mut(path.object)?;
          let id = instance.unwrap_or_else(|| {
                             handler.instances().last().map(|i| i + 1).unwrap_or(0)
                           });
          in_transaction(handler.as_mut(), |h| h.create(id, &req.payload))?;
          let mut rep = msg::response_for(req, msg::code(2, 1));
          msg::set_uri_path(&mut rep, &Path::instance(path.object, id).to_string());
          Ok(rep)
        },
        | _ => Err(DmError::BadRequest),
      },

      | RequestType::Delete => match (path.instance, path.resource, path.resource_instance) {
        | (Some(_), Some(_), Some(_)) => {
          let handler = self.handler_mut(path.object)?;
          in_transaction(handler.as_mut(), |h| h.delete_resource_instance(&path))?;
          Ok(msg::response_for(req, msg::code(2, 2)))
        },
        | (Some(instance), None, None) => {
          let handler = self.handler_mut(path.object)?;
          in_transaction(handler.as_mut(), |h| h.delete(instance))?;
          Ok(msg::response_for(req, msg::code(2, 2)))
        },
        | _ => Err(DmError::BadRequest),
      },

      | other => {
        warn!("unsupported method {:?} for {}", other, path);
        Err(DmError::MethodNotAllowed)
      },
    }
  }
}

/// Run a mutation inside the handler's transaction: begin first, then
/// the operation, then validate, and always end. `committed` is true
/// only when both the operation and validation succeeded.
fn in_transaction<F>(handler: &mut dyn ObjectHandler, op: F) -> DmResult<()>
  where F: FnOnce(&mut dyn ObjectHandler) -> DmResult<()>
{
  handler.transaction_begin();

  let result = op(handler).and_then(|()| handler.transaction_validate());

  handler.transaction_end(result.is_ok());
  result
}

#[cfg(test)]
mod test {
  use std::rc::Rc;
  use std::sync::Mutex;

  use coap_lite::MessageType;

  use super::*;
  use crate::msg::IdGen;

  /// A writable "battery level" object recording its transaction
  /// lifecycle
  struct Battery {
    level: Vec<u8>,
    reject_writes: bool,
    log: Rc<Mutex<Vec<&'static str>>>,
  }

  impl Battery {
    fn new(log: Rc<Mutex<Vec<&'static str>>>) -> Self {
      Self { level: b"98".to_vec(),
             reject_writes: false,
             log }
    }
  }

  impl ObjectHandler for Battery {
    fn object_id(&self) -> u16 {
      3
    }

    fn read(&mut self, _: &Path) -> DmResult<Vec<u8>> {
      Ok(self.level.clone())
    }

    fn write(&mut self, _: &Path, value: &[u8]) -> DmResult<()> {
      self.level = value.to_vec();
      Ok(())
    }

    fn execute(&mut self, path: &Path, _: &[u8]) -> DmResult<()> {
      match path.resource {
        | Some(4) => Ok(()),
        | _ => Err(DmError::MethodNotAllowed),
      }
    }

    fn delete_resource_instance(&mut self, _: &Path) -> DmResult<()> {
      Ok(())
    }

    fn reset(&mut self, _: u16) -> DmResult<()> {
      self.log.lock().unwrap().push("reset");
      self.level = b"0".to_vec();
      Ok(())
    }

    fn transaction_begin(&mut self) {
      self.log.lock().unwrap().push("begin");
    }

    fn transaction_validate(&mut self) -> DmResult<()> {
      self.log.lock().unwrap().push("validate");
      if self.reject_writes {
        Err(DmError::NotAcceptable)
      } else {
        Ok(())
      }
    }

    fn transaction_end(&mut self, committed: bool) {
      self.log
          .lock()
          .unwrap()
          .push(if committed { "end(commit)" } else { "end(rollback)" });
    }
  }

  fn request(method: RequestType, path: &str, payload: &[u8]) -> Packet {
    let mut ids = IdGen::new(1);
    let mut req = msg::request(MessageType::Confirmable, method, ids.id(), ids.token());
    msg::set_uri_path(&mut req, path);
    req.payload = payload.to_vec();
    req
  }

  fn registry() -> (Registry, Rc<Mutex<Vec<&'static str>>>) {
    let log = Rc::new(Mutex::new(vec![]));
    let mut reg = Registry::new();
    reg.add(Box::new(Battery::new(Rc::clone(&log))));
    (reg, log)
  }

  #[test]
  fn read_resource() {
    let (mut reg, _) = registry();
    let rep = reg.dispatch(&request(RequestType::Get, "3/0/9", b""));
    assert_eq!(msg::class_detail(rep.header.code), (2, 5));
    assert_eq!(rep.payload, b"98".to_vec());
  }

  #[test]
  fn write_commits_transaction() {
    let (mut reg, log) = registry();
    let rep = reg.dispatch(&request(RequestType::Put, "3/0/9", b"55"));
    assert_eq!(msg::class_detail(rep.header.code), (2, 4));
    assert_eq!(*log.lock().unwrap(), vec!["begin", "validate", "end(commit)"]);

    let rep = reg.dispatch(&request(RequestType::Get, "3/0/9", b""));
    assert_eq!(rep.payload, b"55".to_vec());
  }

  #[test]
  fn rejected_write_rolls_back() {
    let log = Rc::new(Mutex::new(vec![]));
    let mut battery = Battery::new(Rc::clone(&log));
    battery.reject_writes = true;
    let mut reg = Registry::new();
    reg.add(Box::new(battery));

    let rep = reg.dispatch(&request(RequestType::Put, "3/0/9", b"55"));
    assert_eq!(msg::class_detail(rep.header.code), (4, 6));
    assert_eq!(*log.lock().unwrap(),
               vec!["begin", "validate", "end(rollback)"]);
  }

  #[test]
  fn execute_resource() {
    let (mut reg, _) = registry();
    let rep = reg.dispatch(&request(RequestType::Post, "3/0/4", b""));
    assert_eq!(msg::class_detail(rep.header.code), (2, 4));

    let rep = reg.dispatch(&request(RequestType::Post, "3/0/7", b""));
    assert_eq!(msg::class_detail(rep.header.code), (4, 5));
  }

  #[test]
  fn unknown_object_is_not_found() {
    let (mut reg, _) = registry();
    let rep = reg.dispatch(&request(RequestType::Get, "9/0/0", b""));
    assert_eq!(msg::class_detail(rep.header.code), (4, 4));
  }

  #[test]
  fn garbage_path_is_bad_request() {
    let (mut reg, _) = registry();
    let rep = reg.dispatch(&request(RequestType::Get, "leap/frog", b""));
    assert_eq!(msg::class_detail(rep.header.code), (4, 0));
  }

  #[test]
  fn responses_echo_token_and_id() {
    let (mut reg, _) = registry();
    let req = request(RequestType::Get, "3/0/9", b"");
    let rep = reg.dispatch(&req);

    assert_eq!(rep.header.message_id, req.header.message_id);
    let (rt, qt): (&[u8], &[u8]) = (rep.get_token(), req.get_token());
    assert_eq!(rt, qt);
  }

  #[test]
  fn link_format_lists_instances() {
    struct TwoInstances;
    impl ObjectHandler for TwoInstances {
      fn object_id(&self) -> u16 {
        1
      }
      fn instances(&self) -> Vec<u16> {
        vec![0, 4]
      }
    }

    let (mut reg, _) = registry();
    reg.add(Box::new(TwoInstances));
    assert_eq!(reg.link_format(), "</1/0>,</1/4>,</3/0>");
  }

  #[test]
  fn path_display_round_trips() {
    for s in ["3", "3/0", "3/0/9", "3/0/6/1"] {
      assert_eq!(Path::parse(s).unwrap().to_string(), s);
    }
  }

  #[test]
  fn replacing_an_instance_resets_it_first() {
    let (mut reg, log) = registry();
    let rep = reg.dispatch(&request(RequestType::Put, "3/0", b"55"));
    assert_eq!(msg::class_detail(rep.header.code), (2, 4));
    assert_eq!(*log.lock().unwrap(),
               vec!["begin", "reset", "validate", "end(commit)"]);
  }

  #[test]
  fn resource_instance_delete_commits_transaction() {
    let (mut reg, log) = registry();
    let rep = reg.dispatch(&request(RequestType::Delete, "3/0/6/1", b""));
    assert_eq!(msg::class_detail(rep.header.code), (2, 2));
    assert_eq!(*log.lock().unwrap(), vec!["begin", "validate", "end(commit)"]);
  }

  #[test]
  fn omitted_resource_instance_create_is_not_implemented() {
    let (mut reg, log) = registry();
    let rep = reg.dispatch(&request(RequestType::Post, "3/0/6/1", b"9000"));
    assert_eq!(msg::class_detail(rep.header.code), (5, 1));
    assert_eq!(*log.lock().unwrap(), vec!["begin", "end(rollback)"]);
  }
}
