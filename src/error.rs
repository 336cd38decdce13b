pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error")]
    IOError(#[from] std::io::Error),

    #[error("Firmware file is shorter than the 14-byte GCF header")]
    FileTooShort,

    #[error("Firmware file exceeds the maximum size of {0} bytes")]
    FileTooLarge(usize),

    #[error("Invalid GCF magic {0:#010X}")]
    BadMagic(u32),

    #[error("Declared payload size does not match file size ({declared} != {actual})")]
    SizeMismatch { declared: u32, actual: u32 },

    #[error("Failed to open serial port {0}")]
    ConnectFailed(String),
}
