use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::device::types::{AdapterStatus, DeviceHandle, DiscoveryEvent};
use crate::error::DeviceError;

/// The adapter side of a transport: finding devices and opening channels to them.
pub trait Transport: Send + Sync + 'static {
    fn adapter_status(&self) -> BoxFuture<'_, AdapterStatus>;

    /// Start a discovery session. The stream ends when the session completes.
    fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, DiscoveryEvent>, DeviceError>>;

    fn stop_discovery(&self) -> BoxFuture<'_, ()>;

    /// Allocate a channel to `handle`. Nothing is connected until `Channel::handshake` succeeds.
    fn open(&self, handle: &DeviceHandle) -> BoxFuture<'_, Result<Box<dyn Channel>, DeviceError>>;
}

/// A reliable byte stream to one device.
pub trait Channel: Send + Sync {
    fn handshake(&self) -> BoxFuture<'_, Result<(), DeviceError>>;

    /// Wait until bytes are available and return everything currently buffered.
    /// An empty buffer means the peer closed the channel.
    fn read(&self) -> BoxFuture<'_, Result<Vec<u8>, DeviceError>>;

    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), DeviceError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), DeviceError>>;
}
