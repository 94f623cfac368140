//! C ABI shared between the tonearm host and native plugin libraries.
//!
//! A plugin library exports two required symbols:
//! - [`TONEARM_PLUGIN_IDENTITY_SYMBOL`]: a [`TnIdentityFn`] returning the module name.
//! - [`TONEARM_PLUGIN_CATALOGUE_SYMBOL`]: a [`TnCatalogueFn`] returning the component table.
//!
//! and optionally [`TONEARM_PLUGIN_INSTALL_SYMBOL`] / [`TONEARM_PLUGIN_UNINSTALL_SYMBOL`], which
//! the host calls right after every open and right before every close of the library.
//!
//! Memory produced by a plugin is released through the plugin (`free`, `free_packet`); memory
//! produced by the host is released through the host vtable (`packet_free`). Strings are
//! borrowed views that stay valid for as long as the library is loaded (catalogue data) or for
//! the duration of the call (everything else).
#![allow(clippy::missing_safety_doc)]

use core::ffi::c_void;

pub const TONEARM_PLUGIN_ABI_VERSION: u32 = 1;

pub const TONEARM_PLUGIN_IDENTITY_SYMBOL: &str = "tonearm_plugin_identity";
pub const TONEARM_PLUGIN_CATALOGUE_SYMBOL: &str = "tonearm_plugin_catalogue";
pub const TONEARM_PLUGIN_INSTALL_SYMBOL: &str = "tonearm_plugin_install";
pub const TONEARM_PLUGIN_UNINSTALL_SYMBOL: &str = "tonearm_plugin_uninstall";

// Status codes returned by fallible plugin calls. Plugins may return other non-zero codes.
pub const TN_OK: i32 = 0;
pub const TN_ERR_INVALID_ARG: i32 = 1;
pub const TN_ERR_IO: i32 = 2;
pub const TN_ERR_DECODE: i32 = 3;
pub const TN_ERR_INTERNAL: i32 = 4;

pub type TnIdentityFn = unsafe extern "C" fn() -> TnStr;
pub type TnCatalogueFn = unsafe extern "C" fn() -> TnCatalogue;
pub type TnLifecycleFn = unsafe extern "C" fn();

/// Immutable UTF-8 bytes. Not NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TnStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl TnStr {
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    pub const fn from_static(s: &'static str) -> Self {
        Self {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    /// Borrow a Rust string for the duration of an FFI call.
    pub fn borrowed(s: &str) -> Self {
        Self {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    /// Copy into an owned string, replacing invalid UTF-8.
    ///
    /// # Safety
    /// `ptr` must be null or valid for `len` bytes.
    pub unsafe fn to_string_lossy(self) -> String {
        if self.ptr.is_null() || self.len == 0 {
            return String::new();
        }
        // SAFETY: caller guarantees `ptr` is readable for `len` bytes.
        let bytes = unsafe { core::slice::from_raw_parts(self.ptr, self.len) };
        String::from_utf8_lossy(bytes).into_owned()
    }
}

// Immutable byte view; callers are responsible for lifetime validity.
unsafe impl Send for TnStr {}
unsafe impl Sync for TnStr {}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TnComponentKind {
    Module = 0,
    SoundProcessor = 1,
    StreamInput = 2,
    StreamOutput = 3,
    Widget = 4,
}

impl TnComponentKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Module),
            1 => Some(Self::SoundProcessor),
            2 => Some(Self::StreamInput),
            3 => Some(Self::StreamOutput),
            4 => Some(Self::Widget),
            _ => None,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TnSampleType {
    Unknown = 0,
    Float = 1,
    S8 = 2,
    U8 = 3,
    S16Le = 4,
    S16Be = 5,
    U16Le = 6,
    U16Be = 7,
    S24Le = 8,
    S24Be = 9,
    U24Le = 10,
    U24Be = 11,
    S32Le = 12,
    S32Be = 13,
    U32Le = 14,
    U32Be = 15,
}

impl TnSampleType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Float,
            2 => Self::S8,
            3 => Self::U8,
            4 => Self::S16Le,
            5 => Self::S16Be,
            6 => Self::U16Le,
            7 => Self::U16Be,
            8 => Self::S24Le,
            9 => Self::S24Be,
            10 => Self::U24Le,
            11 => Self::U24Be,
            12 => Self::S32Le,
            13 => Self::S32Be,
            14 => Self::U32Le,
            15 => Self::U32Be,
            _ => Self::Unknown,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TnLogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TnPcmFormat {
    /// A [`TnSampleType`] discriminant.
    pub sample_type: u32,
    pub channels: u16,
    pub reserved: u16,
    pub sample_rate: u32,
}

/// One span of interleaved samples with its inclusive source frame range.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnPcmUnit {
    pub format: TnPcmFormat,
    pub frame_start: u64,
    pub frame_end: u64,
    pub data: *mut u8,
    pub len: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnPcmPacket {
    pub units: *mut TnPcmUnit,
    pub len: usize,
}

impl TnPcmPacket {
    pub const fn empty() -> Self {
        Self {
            units: core::ptr::null_mut(),
            len: 0,
        }
    }
}

/// Callbacks the host hands to every component at construction.
///
/// The buffer functions are the read side of the host's PCM buffer and are meant for stream
/// outputs; packets returned by `buffer_pull` must be handed back through `packet_free`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnHostVTable {
    pub ctx: *mut c_void,
    /// `level` is a [`TnLogLevel`] discriminant.
    pub log: extern "C" fn(ctx: *mut c_void, level: u32, message: TnStr),
    pub buffer_filled_frames: extern "C" fn(ctx: *mut c_void) -> u64,
    pub buffer_pcm_format: extern "C" fn(ctx: *mut c_void) -> TnPcmFormat,
    pub buffer_pull: extern "C" fn(ctx: *mut c_void, frames: u64, out: *mut TnPcmPacket) -> u64,
    pub packet_free: extern "C" fn(ctx: *mut c_void, packet: *mut TnPcmPacket),
}

/// Typed construction parameters passed to `alloc`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnConstructParams {
    pub abi_version: u32,
    pub module: TnStr,
    pub component: TnStr,
    /// `<data_dir>/<module>`; the directory may not exist yet.
    pub resource_dir: TnStr,
    pub host: *const TnHostVTable,
}

/// Host-owned audio file handle seen by stream inputs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnAudioFileRef {
    pub handle: *const c_void,
    pub vtable: *const TnAudioFileVTable,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnAudioFileVTable {
    pub path: extern "C" fn(handle: *const c_void) -> TnStr,
    /// Private data previously stored by the calling component, or null.
    pub private_data: extern "C" fn(handle: *const c_void) -> *mut c_void,
    /// Replace the private data. The previous value's deleter runs first.
    pub set_private_data: extern "C" fn(
        handle: *const c_void,
        data: *mut c_void,
        deleter: Option<unsafe extern "C" fn(data: *mut c_void)>,
    ),
}

/// Sink used by `read_tags`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnTagSink {
    pub ctx: *mut c_void,
    pub put: extern "C" fn(ctx: *mut c_void, key: TnStr, value: TnStr),
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnSoundProcessorVTable {
    /// Transform samples in place. Returns `true` when the data was modified.
    pub modify_packet: unsafe extern "C" fn(
        instance: *mut c_void,
        format: *mut TnPcmFormat,
        data: *mut u8,
        len: usize,
    ) -> bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnStreamInputVTable {
    pub read_frames: unsafe extern "C" fn(
        instance: *mut c_void,
        file: TnAudioFileRef,
        from: u64,
        frames: u64,
        out: *mut TnPcmPacket,
    ) -> i32,
    /// Release a packet produced by `read_frames`.
    pub free_packet: unsafe extern "C" fn(instance: *mut c_void, packet: *mut TnPcmPacket),
    pub calc_total_frames:
        unsafe extern "C" fn(instance: *mut c_void, file: TnAudioFileRef, out: *mut u64) -> i32,
    pub read_tags:
        unsafe extern "C" fn(instance: *mut c_void, file: TnAudioFileRef, sink: TnTagSink) -> i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnStreamOutputVTable {
    pub start_playback: unsafe extern "C" fn(instance: *mut c_void) -> i32,
    pub stop_playback: unsafe extern "C" fn(instance: *mut c_void) -> i32,
    pub pause_playback: unsafe extern "C" fn(instance: *mut c_void) -> i32,
    pub resume_playback: unsafe extern "C" fn(instance: *mut c_void) -> i32,
    /// Fixed device latency in frames. Absent means zero.
    pub output_delay: Option<unsafe extern "C" fn(instance: *mut c_void) -> u64>,
}

/// One catalogue row. Exactly the vtable matching `kind` must be non-null (none for modules
/// and widgets).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnComponentEntry {
    pub name: TnStr,
    /// A [`TnComponentKind`] discriminant.
    pub kind: u32,
    pub alloc: unsafe extern "C" fn(params: *const TnConstructParams) -> *mut c_void,
    pub free: unsafe extern "C" fn(instance: *mut c_void),
    pub sound_processor: *const TnSoundProcessorVTable,
    pub stream_input: *const TnStreamInputVTable,
    pub stream_output: *const TnStreamOutputVTable,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TnCatalogue {
    pub abi_version: u32,
    pub entries: *const TnComponentEntry,
    pub len: usize,
}

// Catalogue tables are static data owned by the loaded library.
unsafe impl Send for TnCatalogue {}
unsafe impl Sync for TnCatalogue {}
unsafe impl Send for TnComponentEntry {}
unsafe impl Sync for TnComponentEntry {}
