//! Device catalog: vendor/product ids and the track layout that goes with
//! each recognised Elektron device.
//!
//! This table is read-only static input data, not something the core
//! computes. Adding a device means adding one [`DeviceDesc`] entry and
//! extending [`CATALOG`] — nothing else in the crate changes.

/// Elektron's USB vendor id. Every device this crate recognises shares it.
pub const ELEKTRON_VENDOR_ID: u16 = 0x1935;

/// A single audio track's wire format: a name for diagnostics/UI and the
/// sample width the device puts on the wire for it.
///
/// 3-byte samples occupy the high 24 bits of a 32-bit slot (low byte
/// zero) and are sign-extended on decode; 4-byte samples are plain
/// big-endian `i32`. Every device in [`CATALOG`] currently uses 4-byte
/// samples, but the field exists so a future "type 3" device is a data
/// change, not a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackDesc {
    pub name: &'static str,
    pub sample_size: u8,
}

const fn track(name: &'static str) -> TrackDesc {
    TrackDesc { name, sample_size: 4 }
}

/// Immutable description of one Overbridge device: product id, display
/// name, and the input/output track layout used to size wire blocks and
/// ring buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDesc {
    pub product_id: u16,
    pub name: &'static str,
    pub input_tracks: &'static [TrackDesc],
    pub output_tracks: &'static [TrackDesc],
}

impl DeviceDesc {
    /// Number of input tracks (host → device direction).
    pub fn inputs(&self) -> usize {
        self.input_tracks.len()
    }

    /// Number of output tracks (device → host direction).
    pub fn outputs(&self) -> usize {
        self.output_tracks.len()
    }

    /// Total bytes of one device→host (output) frame.
    pub fn o2h_frame_bytes(&self) -> usize {
        self.output_tracks.iter().map(|t| t.sample_size as usize).sum()
    }

    /// Total bytes of one host→device (input) frame.
    pub fn h2o_frame_bytes(&self) -> usize {
        self.input_tracks.iter().map(|t| t.sample_size as usize).sum()
    }
}

static DIGITAKT_INPUTS: &[TrackDesc] = &[track("Main L Input"), track("Main R Input")];
static DIGITAKT_OUTPUTS: &[TrackDesc] = &[
    track("Main L"),
    track("Main R"),
    track("Track 1"),
    track("Track 2"),
    track("Track 3"),
    track("Track 4"),
    track("Track 5"),
    track("Track 6"),
    track("Track 7"),
    track("Track 8"),
    track("Input L"),
    track("Input R"),
];

static DIGITONE_INPUTS: &[TrackDesc] = &[track("Main L Input"), track("Main R Input")];
static DIGITONE_OUTPUTS: &[TrackDesc] = &[
    track("Main L"),
    track("Main R"),
    track("Track 1 L"),
    track("Track 1 R"),
    track("Track 2 L"),
    track("Track 2 R"),
    track("Track 3 L"),
    track("Track 3 R"),
    track("Track 4 L"),
    track("Track 4 R"),
    track("Input L"),
    track("Input R"),
];

static AFMK2_INPUTS: &[TrackDesc] = &[
    track("Main L Input"),
    track("Main R Input"),
    track("Synth Track 1 Input"),
    track("Synth Track 2 Input"),
    track("Synth Track 3 Input"),
    track("Synth Track 4 Input"),
];
static AFMK2_OUTPUTS: &[TrackDesc] = &[
    track("Main L"),
    track("Main R"),
    track("Synth Track 1"),
    track("Synth Track 2"),
    track("Synth Track 3"),
    track("Synth Track 4"),
    track("Input L"),
    track("Input R"),
];

static ARMK2_INPUTS: &[TrackDesc] = &[
    track("Main L Input"),
    track("Main R Input"),
    track("Main FX L Input"),
    track("Main FX R Input"),
    track("BD Input"),
    track("SD Input"),
    track("RS/CP Input"),
    track("BT Input"),
    track("LT Input"),
    track("MT/HT Input"),
    track("CH/OH Input"),
    track("CY/CB Input"),
];
static ARMK2_OUTPUTS: &[TrackDesc] = &[
    track("Main L"),
    track("Main R"),
    track("BD"),
    track("SD"),
    track("RS/CP"),
    track("BT"),
    track("LT"),
    track("MT/HT"),
    track("CH/OH"),
    track("CY/CB"),
    track("Input L"),
    track("Input R"),
];

static DKEYS_INPUTS: &[TrackDesc] = &[track("Main L Input"), track("Main R Input")];
static DKEYS_OUTPUTS: &[TrackDesc] = &[
    track("Main L"),
    track("Main R"),
    track("Track 1 L"),
    track("Track 1 R"),
    track("Track 2 L"),
    track("Track 2 R"),
    track("Track 3 L"),
    track("Track 3 R"),
    track("Track 4 L"),
    track("Track 4 R"),
    track("Input L"),
    track("Input R"),
];

static AHMK1_INPUTS: &[TrackDesc] =
    &[track("Main L Input"), track("Main R Input"), track("FX Send L"), track("FX Send R")];
static AHMK1_OUTPUTS: &[TrackDesc] =
    &[track("Main L"), track("Main R"), track("FX Return L"), track("FX Return R")];

static AHMK2_INPUTS: &[TrackDesc] =
    &[track("Main L Input"), track("Main R Input"), track("FX Send L"), track("FX Send R")];
static AHMK2_OUTPUTS: &[TrackDesc] =
    &[track("Main L"), track("Main R"), track("FX Return L"), track("FX Return R")];

/// Recognised devices, in declaration order. [`lookup`] scans this linearly;
/// the catalog is small and fixed so there is no benefit to a map.
pub static CATALOG: &[DeviceDesc] = &[
    DeviceDesc {
        product_id: 0x000c,
        name: "Digitakt",
        input_tracks: DIGITAKT_INPUTS,
        output_tracks: DIGITAKT_OUTPUTS,
    },
    DeviceDesc {
        product_id: 0x0014,
        name: "Digitone",
        input_tracks: DIGITONE_INPUTS,
        output_tracks: DIGITONE_OUTPUTS,
    },
    DeviceDesc {
        product_id: 0x000e,
        name: "Analog Four MKII",
        input_tracks: AFMK2_INPUTS,
        output_tracks: AFMK2_OUTPUTS,
    },
    DeviceDesc {
        product_id: 0x0010,
        name: "Analog Rytm MKII",
        input_tracks: ARMK2_INPUTS,
        output_tracks: ARMK2_OUTPUTS,
    },
    DeviceDesc {
        product_id: 0x001c,
        name: "Digitone Keys",
        input_tracks: DKEYS_INPUTS,
        output_tracks: DKEYS_OUTPUTS,
    },
    DeviceDesc {
        product_id: 0x000a,
        name: "Analog Heat",
        input_tracks: AHMK1_INPUTS,
        output_tracks: AHMK1_OUTPUTS,
    },
    DeviceDesc {
        product_id: 0x0016,
        name: "Analog Heat MKII",
        input_tracks: AHMK2_INPUTS,
        output_tracks: AHMK2_OUTPUTS,
    },
];

/// Looks up a device descriptor by USB product id. The vendor id is not
/// taken as a parameter: callers are expected to have already checked it
/// against [`ELEKTRON_VENDOR_ID`] while enumerating USB devices.
pub fn lookup(product_id: u16) -> Option<&'static DeviceDesc> {
    CATALOG.iter().find(|d| d.product_id == product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digitakt_layout_matches_hardware() {
        let desc = lookup(0x000c).expect("Digitakt must be in the catalog");
        assert_eq!(desc.name, "Digitakt");
        assert_eq!(desc.inputs(), 2);
        assert_eq!(desc.outputs(), 12);
        assert_eq!(desc.o2h_frame_bytes(), 12 * 4);
        assert_eq!(desc.h2o_frame_bytes(), 2 * 4);
    }

    #[test]
    fn unknown_product_id_is_none() {
        assert!(lookup(0xffff).is_none());
    }

    #[test]
    fn catalog_has_no_duplicate_product_ids() {
        for (i, a) in CATALOG.iter().enumerate() {
            for b in &CATALOG[i + 1..] {
                assert_ne!(a.product_id, b.product_id);
            }
        }
    }

    #[test]
    fn every_device_track_name_is_unique_within_direction() {
        for desc in CATALOG {
            let mut seen = std::collections::HashSet::new();
            for t in desc.input_tracks {
                assert!(seen.insert(t.name), "duplicate input track name in {}", desc.name);
            }
            let mut seen = std::collections::HashSet::new();
            for t in desc.output_tracks {
                assert!(seen.insert(t.name), "duplicate output track name in {}", desc.name);
            }
        }
    }
}
