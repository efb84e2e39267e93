mod adapter;
mod bluer_bus;
mod bus;
mod fake_bus;
mod presence;

pub use self::adapter::{AdapterManager, BleAdapter, WatchCallback};
pub use self::bluer_bus::BluerBusProvider;
pub use self::bus::{AdapterInfo, BusEvent, GattLink, HciBus, HciBusProvider, Transport};
pub use self::fake_bus::{FakeBusConfig, FakeBusProvider, FakeHciBus, FixtureDevice, ScanFixture};
