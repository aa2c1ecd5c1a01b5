#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("USB/IP: {0}")]
    UsbIp(#[from] crate::usbip::UsbIpError),
    #[error("USB: {0}")]
    Usb(#[from] crate::usb::UsbError),
    #[error("CTAPHID: {0}")]
    CtapHid(#[from] crate::ctaphid::CtapHidError),
    #[error("CTAP2: {0}")]
    Ctap2(#[from] crate::ctap2::Ctap2Error),
    #[error("U2F: {0}")]
    U2f(#[from] crate::u2f::U2fError),
    #[error("Store: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("COSE: {0}")]
    Cose(#[from] crate::cose::CoseError),
    #[error("Crypto: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
