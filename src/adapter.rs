//! Device adapters turn one raw recording file into a [`ChannelSet`].
//!
//! The format-specific decoding (DICOM physio blocks, AcqKnowledge, Siemens
//! PMU logs, EyeLink EDF) lives outside this crate; anything implementing
//! [`DeviceAdapter`] can be plugged into the session driver.

use std::path::Path;

use crate::error::Result;
use crate::events::EventTable;
use crate::types::ChannelSet;

/// Capability interface: "given a file, produce channels with timestamps".
pub trait DeviceAdapter {
    /// Short name used in logs, e.g. `"acq"`.
    fn name(&self) -> &str;

    /// File extensions handled by this adapter, without the dot, lower case.
    fn extensions(&self) -> &[&str];

    /// Whether this device's clock can be compared with the scanner clock.
    ///
    /// Recordings from adapters returning `false` are matched by position
    /// instead of by time overlap.
    fn clock_trusted(&self) -> bool {
        true
    }

    /// Decodes `path`.
    ///
    /// # Errors
    ///
    /// * `PhysioError::Parse` - the file is unreadable or malformed
    fn parse(&self, path: &Path) -> Result<ChannelSet>;

    /// Events stored in `path` (button presses, stimulus markers), with
    /// onsets relative to the start of the recording `parse` returns.
    ///
    /// Most devices record none, hence the default.
    fn parse_events(&self, _path: &Path) -> Result<Option<EventTable>> {
        Ok(None)
    }

    fn accepts(&self, path: &Path) -> bool {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_ascii_lowercase(),
            None => return false,
        };
        self.extensions()
            .iter()
            .any(|ext| name.ends_with(&format!(".{}", ext)))
    }
}

/// The adapters available to a session, tried in registration order.
#[derive(Default)]
pub struct AdapterSet {
    adapters: Vec<Box<dyn DeviceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<A: DeviceAdapter + 'static>(mut self, adapter: A) -> Self {
        self.register(adapter);
        self
    }

    pub fn register<A: DeviceAdapter + 'static>(&mut self, adapter: A) {
        self.adapters.push(Box::new(adapter));
    }

    /// First adapter accepting `path`.
    pub fn find(&self, path: &Path) -> Option<&dyn DeviceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.accepts(path))
            .map(|a| &**a)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PhysioError;
    use std::path::PathBuf;

    struct Stub {
        exts: Vec<&'static str>,
    }

    impl DeviceAdapter for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        fn extensions(&self) -> &[&str] {
            &self.exts
        }

        fn parse(&self, path: &Path) -> Result<ChannelSet> {
            Err(PhysioError::parse(path, "stub"))
        }
    }

    #[test]
    fn test_accepts_by_extension_case_insensitive() {
        let stub = Stub { exts: vec!["acq", "tsv.gz"] };
        assert!(stub.accepts(&PathBuf::from("/data/Run1.ACQ")));
        assert!(stub.accepts(&PathBuf::from("rec.tsv.gz")));
        assert!(!stub.accepts(&PathBuf::from("rec.tsv")));
        assert!(!stub.accepts(&PathBuf::from("acq")));
        assert!(stub.clock_trusted());
        assert!(stub.parse_events(&PathBuf::from("a.acq")).unwrap().is_none());
    }

    #[test]
    fn test_find_uses_registration_order() {
        let set = AdapterSet::new()
            .with(Stub { exts: vec!["log"] })
            .with(Stub { exts: vec!["log", "edf"] });
        assert_eq!(set.len(), 2);
        assert!(set.find(&PathBuf::from("a.edf")).is_some());
        assert!(set.find(&PathBuf::from("a.dcm")).is_none());
    }
}
