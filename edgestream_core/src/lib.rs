pub mod accelerator;
pub mod capture;
pub mod compress;
pub mod configuration;
pub mod detection;
pub mod fps_meter;
pub mod outbound;
pub mod protocol;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod test;

pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}
