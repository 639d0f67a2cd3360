pub mod frame;
pub mod retry;
pub mod transport;

pub use retry::{RetryMachine, RetryPolicy, RetryState, Sleeper, TokioSleeper};
pub use transport::{
    Connector, ModbusLink, RegisterTransport, TcpConnector, TcpLink, Transport, TransportSettings,
};
