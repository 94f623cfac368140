//! Native plugin libraries loaded with `libloading` over the `tonearm-plugin-api` C ABI.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use libloading::Library;
use tonearm_plugin_api::{
    TN_ERR_DECODE, TN_ERR_INTERNAL, TN_ERR_INVALID_ARG, TN_ERR_IO, TN_OK,
    TONEARM_PLUGIN_ABI_VERSION, TONEARM_PLUGIN_CATALOGUE_SYMBOL, TONEARM_PLUGIN_IDENTITY_SYMBOL,
    TONEARM_PLUGIN_INSTALL_SYMBOL, TONEARM_PLUGIN_UNINSTALL_SYMBOL, TnAudioFileRef,
    TnAudioFileVTable, TnCatalogueFn, TnComponentEntry, TnComponentKind, TnConstructParams,
    TnHostVTable, TnIdentityFn, TnLifecycleFn, TnLogLevel, TnPcmFormat, TnPcmPacket, TnPcmUnit,
    TnSampleType, TnSoundProcessorVTable, TnStr, TnStreamInputVTable, TnStreamOutputVTable,
    TnTagSink,
};
use tonearm_types::{
    AudioTags, ComponentKind, PcmFormat, PcmPacket, PcmPacketUnit, SampleType, packet_frames,
};

use crate::audio_file::AudioFile;
use crate::component::{
    ComponentBody, ComponentContext, ComponentId, Module, PcmSource, SoundProcessor, StreamInput,
    StreamOutput, Widget,
};
use crate::error::RegistryError;
use crate::registry::{CatalogueEntry, LibraryLoader, PluginLibrary};

/// Opens shared libraries from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl LibraryLoader for NativeLoader {
    fn open(&self, path: &Path) -> Result<Arc<dyn PluginLibrary>, RegistryError> {
        let library = NativeLibrary::open(path)?;
        Ok(Arc::new(library))
    }
}

struct NativeEntry {
    name: String,
    kind: ComponentKind,
    raw: TnComponentEntry,
}

/// A loaded shared library. Unloaded when the last `Arc` (registry slot or live instance) drops.
pub struct NativeLibrary {
    path: PathBuf,
    identity: String,
    entries: Vec<NativeEntry>,
    install: Option<TnLifecycleFn>,
    uninstall: Option<TnLifecycleFn>,
    // Declared last: every pointer above points into this library.
    _lib: Library,
}

fn required_symbol<T: Copy>(
    lib: &Library,
    path: &Path,
    symbol: &'static str,
) -> Result<T, RegistryError> {
    // SAFETY: `T` is the function type tonearm-plugin-api declares for `symbol`.
    unsafe { lib.get::<T>(symbol.as_bytes()) }
        .map(|s| *s)
        .map_err(|_| RegistryError::MissingSymbol {
            path: path.to_path_buf(),
            symbol,
        })
}

fn optional_symbol<T: Copy>(lib: &Library, symbol: &'static str) -> Option<T> {
    // SAFETY: as in `required_symbol`.
    unsafe { lib.get::<T>(symbol.as_bytes()) }.ok().map(|s| *s)
}

fn check_abi_version(path: &Path, found: u32) -> Result<(), RegistryError> {
    if found == TONEARM_PLUGIN_ABI_VERSION {
        return Ok(());
    }
    Err(RegistryError::AbiMismatch {
        path: path.to_path_buf(),
        found,
        expected: TONEARM_PLUGIN_ABI_VERSION,
    })
}

impl NativeLibrary {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        // SAFETY: loading a plugin runs its initialisers; plugin directories are trusted input.
        let lib = unsafe { Library::new(path) }.map_err(|e| RegistryError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let identity_fn: TnIdentityFn =
            required_symbol(&lib, path, TONEARM_PLUGIN_IDENTITY_SYMBOL)?;
        let catalogue_fn: TnCatalogueFn =
            required_symbol(&lib, path, TONEARM_PLUGIN_CATALOGUE_SYMBOL)?;
        let install = optional_symbol::<TnLifecycleFn>(&lib, TONEARM_PLUGIN_INSTALL_SYMBOL);
        let uninstall = optional_symbol::<TnLifecycleFn>(&lib, TONEARM_PLUGIN_UNINSTALL_SYMBOL);

        // SAFETY: identity returns a view into static library data.
        let identity = unsafe { identity_fn().to_string_lossy() };
        if identity.is_empty() {
            return Err(RegistryError::EmptyIdentity {
                path: path.to_path_buf(),
            });
        }

        // SAFETY: the catalogue is static library data valid while `lib` is loaded.
        let catalogue = unsafe { catalogue_fn() };
        check_abi_version(path, catalogue.abi_version)?;
        let raw_entries: &[TnComponentEntry] = if catalogue.entries.is_null() || catalogue.len == 0
        {
            &[]
        } else {
            // SAFETY: non-null table of `len` entries per the ABI.
            unsafe { slice::from_raw_parts(catalogue.entries, catalogue.len) }
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            // SAFETY: catalogue strings are static library data.
            let name = unsafe { raw.name.to_string_lossy() };
            let Some(kind) = TnComponentKind::from_u32(raw.kind).map(component_kind) else {
                tracing::warn!(module = %identity, component = %name, kind = raw.kind, "unknown component kind; skipped");
                continue;
            };
            if name.is_empty() || name.contains('/') {
                tracing::warn!(module = %identity, component = %name, "invalid component name; skipped");
                continue;
            }
            let vtable_present = match kind {
                ComponentKind::SoundProcessor => !raw.sound_processor.is_null(),
                ComponentKind::StreamInput => !raw.stream_input.is_null(),
                ComponentKind::StreamOutput => !raw.stream_output.is_null(),
                ComponentKind::Module | ComponentKind::Widget => true,
            };
            if !vtable_present {
                tracing::warn!(module = %identity, component = %name, %kind, "component vtable missing; skipped");
                continue;
            }
            entries.push(NativeEntry {
                name,
                kind,
                raw: *raw,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            identity,
            entries,
            install,
            uninstall,
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        tracing::debug!(module = %self.identity, path = ?self.path, "unloading plugin library");
    }
}

impl PluginLibrary for NativeLibrary {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn catalogue(&self) -> Vec<CatalogueEntry> {
        self.entries
            .iter()
            .map(|e| CatalogueEntry {
                component: e.name.clone(),
                kind: e.kind,
            })
            .collect()
    }

    fn install(&self) {
        if let Some(install) = self.install {
            // SAFETY: exported lifecycle hook; takes no arguments.
            unsafe { install() };
        }
    }

    fn uninstall(&self) {
        if let Some(uninstall) = self.uninstall {
            // SAFETY: exported lifecycle hook; takes no arguments.
            unsafe { uninstall() };
        }
    }

    fn instantiate(
        self: Arc<Self>,
        component: &str,
        ctx: Arc<ComponentContext>,
    ) -> Result<ComponentBody> {
        let (kind, raw) = self
            .entries
            .iter()
            .find(|e| e.name == component)
            .map(|e| (e.kind, e.raw))
            .ok_or_else(|| anyhow!("`{}` has no component `{component}`", self.identity))?;

        let host_ctx = Box::new(HostCtx {
            module: self.identity.clone(),
            pcm: ctx.pcm_source(),
        });
        let host = Box::new(TnHostVTable {
            ctx: ptr::from_ref::<HostCtx>(&host_ctx).cast_mut().cast(),
            log: host_log,
            buffer_filled_frames: host_filled_frames,
            buffer_pcm_format: host_pcm_format,
            buffer_pull: host_pull,
            packet_free: host_packet_free,
        });
        let resource_dir = ctx.resource_dir().to_string_lossy().into_owned();
        let params = TnConstructParams {
            abi_version: TONEARM_PLUGIN_ABI_VERSION,
            module: TnStr::borrowed(&self.identity),
            component: TnStr::borrowed(component),
            resource_dir: TnStr::borrowed(&resource_dir),
            host: ptr::from_ref::<TnHostVTable>(&host),
        };

        // SAFETY: `params` outlives the call; the host vtable box lives as long as the instance.
        let instance = unsafe { (raw.alloc)(&params) };
        if instance.is_null() {
            bail!("`{}/{component}` failed to construct", self.identity);
        }

        let inner = NativeInstance {
            entry: raw,
            instance,
            owner: ctx.id(),
            _host: host,
            _host_ctx: host_ctx,
            library: self,
        };
        // SAFETY (all arms): `open` only keeps entries whose vtable for `kind` is non-null.
        let body = match kind {
            ComponentKind::StreamInput => ComponentBody::StreamInput(Box::new(NativeStreamInput {
                vtable: unsafe { *raw.stream_input },
                inner,
            })),
            ComponentKind::StreamOutput => {
                ComponentBody::StreamOutput(Box::new(NativeStreamOutput {
                    vtable: unsafe { *raw.stream_output },
                    inner,
                }))
            }
            ComponentKind::SoundProcessor => {
                ComponentBody::SoundProcessor(Box::new(NativeSoundProcessor {
                    vtable: unsafe { *raw.sound_processor },
                    inner,
                }))
            }
            ComponentKind::Module => ComponentBody::Module(Box::new(NativeOpaque { _instance: inner })),
            ComponentKind::Widget => ComponentBody::Widget(Box::new(NativeOpaque { _instance: inner })),
        };
        Ok(body)
    }
}

fn component_kind(kind: TnComponentKind) -> ComponentKind {
    match kind {
        TnComponentKind::Module => ComponentKind::Module,
        TnComponentKind::SoundProcessor => ComponentKind::SoundProcessor,
        TnComponentKind::StreamInput => ComponentKind::StreamInput,
        TnComponentKind::StreamOutput => ComponentKind::StreamOutput,
        TnComponentKind::Widget => ComponentKind::Widget,
    }
}

fn to_tn_sample(sample: SampleType) -> TnSampleType {
    match sample {
        SampleType::Unknown => TnSampleType::Unknown,
        SampleType::Float => TnSampleType::Float,
        SampleType::S8 => TnSampleType::S8,
        SampleType::U8 => TnSampleType::U8,
        SampleType::S16Le => TnSampleType::S16Le,
        SampleType::S16Be => TnSampleType::S16Be,
        SampleType::U16Le => TnSampleType::U16Le,
        SampleType::U16Be => TnSampleType::U16Be,
        SampleType::S24Le => TnSampleType::S24Le,
        SampleType::S24Be => TnSampleType::S24Be,
        SampleType::U24Le => TnSampleType::U24Le,
        SampleType::U24Be => TnSampleType::U24Be,
        SampleType::S32Le => TnSampleType::S32Le,
        SampleType::S32Be => TnSampleType::S32Be,
        SampleType::U32Le => TnSampleType::U32Le,
        SampleType::U32Be => TnSampleType::U32Be,
    }
}

fn from_tn_sample(sample: TnSampleType) -> SampleType {
    match sample {
        TnSampleType::Unknown => SampleType::Unknown,
        TnSampleType::Float => SampleType::Float,
        TnSampleType::S8 => SampleType::S8,
        TnSampleType::U8 => SampleType::U8,
        TnSampleType::S16Le => SampleType::S16Le,
        TnSampleType::S16Be => SampleType::S16Be,
        TnSampleType::U16Le => SampleType::U16Le,
        TnSampleType::U16Be => SampleType::U16Be,
        TnSampleType::S24Le => SampleType::S24Le,
        TnSampleType::S24Be => SampleType::S24Be,
        TnSampleType::U24Le => SampleType::U24Le,
        TnSampleType::U24Be => SampleType::U24Be,
        TnSampleType::S32Le => SampleType::S32Le,
        TnSampleType::S32Be => SampleType::S32Be,
        TnSampleType::U32Le => SampleType::U32Le,
        TnSampleType::U32Be => SampleType::U32Be,
    }
}

fn to_tn_format(format: PcmFormat) -> TnPcmFormat {
    TnPcmFormat {
        sample_type: to_tn_sample(format.sample_type) as u32,
        channels: format.channels,
        reserved: 0,
        sample_rate: format.sample_rate,
    }
}

fn from_tn_format(format: TnPcmFormat) -> PcmFormat {
    PcmFormat::new(
        from_tn_sample(TnSampleType::from_u32(format.sample_type)),
        format.channels,
        format.sample_rate,
    )
}

fn describe_status(status: i32) -> &'static str {
    match status {
        TN_OK => "ok",
        TN_ERR_INVALID_ARG => "invalid argument",
        TN_ERR_IO => "i/o error",
        TN_ERR_DECODE => "decode error",
        TN_ERR_INTERNAL => "internal error",
        _ => "plugin-specific error",
    }
}

fn check_status(op: &str, status: i32) -> Result<()> {
    if status == TN_OK {
        Ok(())
    } else {
        Err(anyhow!("{op} failed: {} (status {status})", describe_status(status)))
    }
}

/// Move a host packet into plugin-visible memory; released by `free_ffi_packet`.
fn packet_to_ffi(packet: PcmPacket) -> TnPcmPacket {
    if packet.is_empty() {
        return TnPcmPacket::empty();
    }
    let units: Box<[TnPcmUnit]> = packet
        .into_iter()
        .map(|unit| {
            let len = unit.pcm.len();
            let data = Box::into_raw(unit.pcm.into_boxed_slice()).cast::<u8>();
            TnPcmUnit {
                format: to_tn_format(unit.format),
                frame_start: unit.frame_start,
                frame_end: unit.frame_end,
                data,
                len,
            }
        })
        .collect();
    let len = units.len();
    TnPcmPacket {
        units: Box::into_raw(units).cast::<TnPcmUnit>(),
        len,
    }
}

/// # Safety
/// `packet` must come from `packet_to_ffi` and not have been freed.
unsafe fn free_ffi_packet(packet: TnPcmPacket) {
    if packet.units.is_null() {
        return;
    }
    // SAFETY: allocated as a boxed slice of `len` units in `packet_to_ffi`.
    let units = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(packet.units, packet.len)) };
    for unit in units.iter() {
        if !unit.data.is_null() {
            // SAFETY: allocated as a boxed slice of `len` bytes in `packet_to_ffi`.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(unit.data, unit.len)) });
        }
    }
}

/// Copy a plugin-owned packet into host memory.
///
/// # Safety
/// `packet` must describe valid units and sample data.
unsafe fn packet_from_ffi(packet: &TnPcmPacket) -> PcmPacket {
    if packet.units.is_null() || packet.len == 0 {
        return Vec::new();
    }
    // SAFETY: caller guarantees validity.
    let units = unsafe { slice::from_raw_parts(packet.units, packet.len) };
    units
        .iter()
        .map(|unit| {
            let pcm = if unit.data.is_null() || unit.len == 0 {
                Vec::new()
            } else {
                // SAFETY: caller guarantees validity.
                unsafe { slice::from_raw_parts(unit.data, unit.len) }.to_vec()
            };
            PcmPacketUnit::new(from_tn_format(unit.format), unit.frame_start, pcm)
        })
        .filter(|unit| !unit.is_empty())
        .collect()
}

struct HostCtx {
    module: String,
    pcm: Arc<dyn PcmSource>,
}

/// # Safety
/// `ctx` must be the `HostCtx` boxed next to the vtable it was handed out with.
unsafe fn host_ctx<'a>(ctx: *mut c_void) -> &'a HostCtx {
    // SAFETY: caller guarantees.
    unsafe { &*ctx.cast::<HostCtx>() }
}

extern "C" fn host_log(ctx: *mut c_void, level: u32, message: TnStr) {
    // SAFETY: handed out with this vtable; message is valid for the call.
    let (ctx, message) = unsafe { (host_ctx(ctx), message.to_string_lossy()) };
    let module = ctx.module.as_str();
    match level {
        l if l == TnLogLevel::Error as u32 => {
            tracing::error!(target: "tonearm::plugin", module, "{message}")
        }
        l if l == TnLogLevel::Warn as u32 => {
            tracing::warn!(target: "tonearm::plugin", module, "{message}")
        }
        l if l == TnLogLevel::Info as u32 => {
            tracing::info!(target: "tonearm::plugin", module, "{message}")
        }
        l if l == TnLogLevel::Debug as u32 => {
            tracing::debug!(target: "tonearm::plugin", module, "{message}")
        }
        _ => tracing::trace!(target: "tonearm::plugin", module, "{message}"),
    }
}

extern "C" fn host_filled_frames(ctx: *mut c_void) -> u64 {
    // SAFETY: handed out with this vtable.
    unsafe { host_ctx(ctx) }.pcm.filled_frames()
}

extern "C" fn host_pcm_format(ctx: *mut c_void) -> TnPcmFormat {
    // SAFETY: handed out with this vtable.
    to_tn_format(unsafe { host_ctx(ctx) }.pcm.pcm_format())
}

extern "C" fn host_pull(ctx: *mut c_void, frames: u64, out: *mut TnPcmPacket) -> u64 {
    if out.is_null() {
        return 0;
    }
    // SAFETY: handed out with this vtable.
    let packet = unsafe { host_ctx(ctx) }.pcm.pull_packet(frames);
    let pulled = packet_frames(&packet);
    // SAFETY: `out` is a writable packet slot owned by the caller.
    unsafe { out.write(packet_to_ffi(packet)) };
    pulled
}

extern "C" fn host_packet_free(_ctx: *mut c_void, packet: *mut TnPcmPacket) {
    if packet.is_null() {
        return;
    }
    // SAFETY: the plugin returns a packet obtained from `host_pull`; the slot is emptied so a
    // second free is a no-op.
    unsafe { free_ffi_packet(ptr::replace(packet, TnPcmPacket::empty())) };
}

/// Private data stored on an [`AudioFile`] by a native stream input.
struct NativePrivate {
    ptr: *mut c_void,
    deleter: Option<unsafe extern "C" fn(*mut c_void)>,
    _library: Arc<NativeLibrary>,
}

// SAFETY: the pointer is opaque plugin state that is only touched through the owning input.
unsafe impl Send for NativePrivate {}

impl Drop for NativePrivate {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter
            && !self.ptr.is_null()
        {
            // SAFETY: the plugin supplied this deleter for this pointer; its library is alive.
            unsafe { deleter(self.ptr) };
        }
    }
}

struct FileCtx<'a> {
    file: &'a AudioFile,
    owner: ComponentId,
    library: &'a Arc<NativeLibrary>,
    path: String,
}

static AUDIO_FILE_VTABLE: TnAudioFileVTable = TnAudioFileVTable {
    path: file_path,
    private_data: file_private_data,
    set_private_data: file_set_private_data,
};

/// # Safety
/// `handle` must point at a live `FileCtx`.
unsafe fn file_ctx<'a>(handle: *const c_void) -> &'a FileCtx<'a> {
    // SAFETY: caller guarantees.
    unsafe { &*handle.cast::<FileCtx<'a>>() }
}

extern "C" fn file_path(handle: *const c_void) -> TnStr {
    // SAFETY: only reachable during `with_file_ref`.
    TnStr::borrowed(&unsafe { file_ctx(handle) }.path)
}

extern "C" fn file_private_data(handle: *const c_void) -> *mut c_void {
    // SAFETY: only reachable during `with_file_ref`.
    let ctx = unsafe { file_ctx(handle) };
    ctx.file
        .with_private_data::<NativePrivate, _>(ctx.owner, |data| {
            data.map(|d| d.ptr).unwrap_or(ptr::null_mut())
        })
}

extern "C" fn file_set_private_data(
    handle: *const c_void,
    data: *mut c_void,
    deleter: Option<unsafe extern "C" fn(*mut c_void)>,
) {
    // SAFETY: only reachable during `with_file_ref`.
    let ctx = unsafe { file_ctx(handle) };
    if data.is_null() {
        ctx.file.release_private_data(ctx.owner);
        return;
    }
    ctx.file.set_private_data(
        ctx.owner,
        Box::new(NativePrivate {
            ptr: data,
            deleter,
            _library: ctx.library.clone(),
        }),
    );
}

fn with_file_ref<R>(
    file: &AudioFile,
    owner: ComponentId,
    library: &Arc<NativeLibrary>,
    f: impl FnOnce(TnAudioFileRef) -> R,
) -> R {
    let ctx = FileCtx {
        file,
        owner,
        library,
        path: file.path().to_string_lossy().into_owned(),
    };
    f(TnAudioFileRef {
        handle: ptr::from_ref(&ctx).cast(),
        vtable: &AUDIO_FILE_VTABLE,
    })
}

extern "C" fn tag_put(ctx: *mut c_void, key: TnStr, value: TnStr) {
    // SAFETY: `ctx` is the tag map borrowed for the duration of `read_tags`.
    let tags = unsafe { &mut *ctx.cast::<AudioTags>() };
    // SAFETY: strings are valid for the call.
    let (key, value) = unsafe { (key.to_string_lossy(), value.to_string_lossy()) };
    if !key.is_empty() {
        tags.insert(key, value);
    }
}

/// One plugin-allocated component instance.
struct NativeInstance {
    entry: TnComponentEntry,
    instance: *mut c_void,
    owner: ComponentId,
    _host: Box<TnHostVTable>,
    _host_ctx: Box<HostCtx>,
    // Declared last so the library outlives everything above.
    library: Arc<NativeLibrary>,
}

// SAFETY: instances are driven through `&mut self` from one thread at a time.
unsafe impl Send for NativeInstance {}

impl Drop for NativeInstance {
    fn drop(&mut self) {
        // SAFETY: `instance` came from this entry's `alloc` and is freed exactly once.
        unsafe { (self.entry.free)(self.instance) };
    }
}

struct NativeStreamInput {
    vtable: TnStreamInputVTable,
    inner: NativeInstance,
}

impl StreamInput for NativeStreamInput {
    fn read_frames(&mut self, file: &AudioFile, from: u64, frames: u64) -> Result<PcmPacket> {
        let mut raw = TnPcmPacket::empty();
        let instance = self.inner.instance;
        let status = with_file_ref(file, self.inner.owner, &self.inner.library, |file_ref| {
            // SAFETY: live instance; `raw` is a writable slot.
            unsafe { (self.vtable.read_frames)(instance, file_ref, from, frames, &mut raw) }
        });
        // SAFETY: on success the plugin filled `raw`; it stays valid until `free_packet`.
        let packet = unsafe { packet_from_ffi(&raw) };
        if !raw.units.is_null() {
            // SAFETY: packet produced by this instance's `read_frames`.
            unsafe { (self.vtable.free_packet)(instance, &mut raw) };
        }
        check_status("read_frames", status)?;
        Ok(packet)
    }

    fn calc_total_frames(&mut self, file: &AudioFile) -> Result<u64> {
        let mut total = 0u64;
        let instance = self.inner.instance;
        let status = with_file_ref(file, self.inner.owner, &self.inner.library, |file_ref| {
            // SAFETY: live instance; `total` is a writable slot.
            unsafe { (self.vtable.calc_total_frames)(instance, file_ref, &mut total) }
        });
        check_status("calc_total_frames", status)?;
        Ok(total)
    }

    fn read_tags(&mut self, file: &AudioFile) -> Result<AudioTags> {
        let mut tags = BTreeMap::new();
        let sink = TnTagSink {
            ctx: ptr::from_mut(&mut tags).cast(),
            put: tag_put,
        };
        let instance = self.inner.instance;
        let status = with_file_ref(file, self.inner.owner, &self.inner.library, |file_ref| {
            // SAFETY: live instance; the sink map outlives the call.
            unsafe { (self.vtable.read_tags)(instance, file_ref, sink) }
        });
        check_status("read_tags", status)?;
        Ok(tags)
    }
}

struct NativeStreamOutput {
    vtable: TnStreamOutputVTable,
    inner: NativeInstance,
}

impl StreamOutput for NativeStreamOutput {
    fn start_playback(&mut self) -> Result<()> {
        // SAFETY: live instance.
        check_status("start_playback", unsafe {
            (self.vtable.start_playback)(self.inner.instance)
        })
    }

    fn stop_playback(&mut self) -> Result<()> {
        // SAFETY: live instance.
        check_status("stop_playback", unsafe {
            (self.vtable.stop_playback)(self.inner.instance)
        })
    }

    fn pause_playback(&mut self) -> Result<()> {
        // SAFETY: live instance.
        check_status("pause_playback", unsafe {
            (self.vtable.pause_playback)(self.inner.instance)
        })
    }

    fn resume_playback(&mut self) -> Result<()> {
        // SAFETY: live instance.
        check_status("resume_playback", unsafe {
            (self.vtable.resume_playback)(self.inner.instance)
        })
    }

    fn output_delay(&self) -> u64 {
        match self.vtable.output_delay {
            // SAFETY: live instance.
            Some(delay) => unsafe { delay(self.inner.instance) },
            None => 0,
        }
    }
}

struct NativeSoundProcessor {
    vtable: TnSoundProcessorVTable,
    inner: NativeInstance,
}

impl SoundProcessor for NativeSoundProcessor {
    fn modify_packet(&mut self, unit: &mut PcmPacketUnit) -> bool {
        let mut format = to_tn_format(unit.format);
        // SAFETY: live instance; the sample slice is valid and exclusively borrowed.
        let modified = unsafe {
            (self.vtable.modify_packet)(
                self.inner.instance,
                &mut format,
                unit.pcm.as_mut_ptr(),
                unit.pcm.len(),
            )
        };
        let format = from_tn_format(format);
        if format != unit.format {
            if format.bytes_per_frame() == unit.format.bytes_per_frame() {
                unit.format = format;
            } else {
                tracing::warn!(
                    module = %self.inner.library.identity,
                    from = %unit.format,
                    to = %format,
                    "sound processor changed frame width; format change ignored"
                );
            }
        }
        modified
    }
}

/// Modules and widgets: nothing to call besides construction and destruction.
struct NativeOpaque {
    _instance: NativeInstance,
}

impl Module for NativeOpaque {}
impl Widget for NativeOpaque {}
