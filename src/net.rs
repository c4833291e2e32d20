use no_std_net::SocketAddr;

/// Data that came from (or is bound for) a network socket
#[derive(PartialEq, PartialOrd, Eq, Ord, Hash, Debug, Clone, Copy)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this Addressed
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the socket and get the data in this Addressed
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data contained in this Addressed
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Borrow the contents of the addressed item
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the contents of the addressed item
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// Copy the socket address for the data
  pub fn addr(&self) -> SocketAddr {
    self.1
  }

  /// Turn the entire structure into something else
  pub fn fold<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> R {
    f(self.0, self.1)
  }
}

impl<T> AsMut<T> for Addrd<T> {
  fn as_mut(&mut self) -> &mut T {
    &mut self.0
  }
}

/// A non-blocking datagram transport for CoAP messages.
///
/// Implementations wrap whatever the host platform offers - a plain UDP
/// socket, a DTLS session, a serial tunnel. The client core never creates or
/// connects sockets itself; it is handed an implementor that is already bound
/// (and, for DTLS, already in or past its handshake).
///
/// Every operation is non-blocking **by contract**: anything that cannot
/// complete immediately returns [`nb::Error::WouldBlock`], and the caller
/// must retry later with identical arguments. No operation may ever block
/// the calling thread.
pub trait Socket {
  /// The error yielded by socket operations
  type Error: core::fmt::Debug;

  /// Send one whole datagram to a remote address.
  ///
  /// A datagram is sent in full or not at all; `WouldBlock` means "nothing
  /// was sent, try again with the same bytes."
  fn send(&mut self, dgram: Addrd<&[u8]>) -> nb::Result<(), Self::Error>;

  /// Pull a buffered datagram from the socket, along with the address of
  /// the sender.
  ///
  /// `WouldBlock` means no datagram is currently available. A datagram
  /// larger than `buffer` is an implementation-defined hard error, never a
  /// silent truncation.
  fn recv(&mut self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error>;

  /// The largest datagram payload the underlying transport can carry
  /// without fragmentation.
  ///
  /// The exchange engine derives its preferred block size from this.
  fn inner_mtu(&self) -> usize;

  /// Turn the receive path off (`false`) or back on (`true`).
  ///
  /// Queue Mode uses this to stop listening for inbound traffic between
  /// self-initiated exchanges. Implementations that cannot stop receiving
  /// may simply discard inbound datagrams while off.
  fn rx_enabled(&mut self, enabled: bool);

  /// Begin or continue non-blocking teardown of the transport.
  ///
  /// `WouldBlock` means teardown is underway and `shutdown` must be called
  /// again; `Ok(())` means the transport is fully released. A hard error
  /// here may leak transport resources - callers log it and consider the
  /// socket gone regardless.
  fn shutdown(&mut self) -> nb::Result<(), Self::Error>;

  /// Poll the socket for a single datagram using `buffer` as scratch space,
  /// mapping `WouldBlock` to `Ok(None)`.
  fn poll(&mut self, buffer: &mut [u8]) -> Result<Option<Addrd<Vec<u8>>>, Self::Error> {
    match self.recv(buffer) {
      | Ok(Addrd(n, addr)) => Ok(Some(Addrd(buffer[..n].to_vec(), addr))),
      | Err(nb::Error::WouldBlock) => Ok(None),
      | Err(nb::Error::Other(e)) => Err(e),
    }
  }
}
