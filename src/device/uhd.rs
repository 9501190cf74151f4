//! USRP backend over the UHD C API.
//!
//! Manual, minimal FFI bindings: only the calls the run sequence and the
//! capture/burst helpers need. Linked by `build.rs` when the `uhd` feature is
//! enabled.

use anyhow::Result;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use super::{
    Direction, GpioAttr, RecvOutcome, RxStream, SdrDevice, StreamCommand, TimeSpec, TxMetadata,
    TxStream,
};
use crate::iq::Sc16;

type UhdError = c_int;
const UHD_ERROR_NONE: UhdError = 0;

type UhdUsrpHandle = *mut c_void;
type UhdRxStreamerHandle = *mut c_void;
type UhdTxStreamerHandle = *mut c_void;
type UhdRxMetadataHandle = *mut c_void;
type UhdTxMetadataHandle = *mut c_void;

const UHD_STREAM_MODE_START_CONTINUOUS: c_int = 97;
const UHD_STREAM_MODE_STOP_CONTINUOUS: c_int = 111;
const UHD_STREAM_MODE_NUM_SAMPS_AND_DONE: c_int = 100;

const UHD_RX_METADATA_ERROR_CODE_NONE: c_int = 0x0;
const UHD_RX_METADATA_ERROR_CODE_TIMEOUT: c_int = 0x1;
const UHD_RX_METADATA_ERROR_CODE_OVERFLOW: c_int = 0x8;

const MBOARD: usize = 0;

#[repr(C)]
struct UhdStreamArgs {
    cpu_format: *mut c_char,
    otw_format: *mut c_char,
    args: *mut c_char,
    channel_list: *mut usize,
    n_channels: c_int,
}

#[repr(C)]
struct UhdStreamCmd {
    stream_mode: c_int,
    num_samps: usize,
    stream_now: bool,
    time_spec_full_secs: i64,
    time_spec_frac_secs: c_double,
}

#[repr(C)]
struct UhdUsrpRxInfo {
    mboard_id: *mut c_char,
    mboard_name: *mut c_char,
    mboard_serial: *mut c_char,
    rx_id: *mut c_char,
    rx_subdev_name: *mut c_char,
    rx_subdev_spec: *mut c_char,
    rx_serial: *mut c_char,
    rx_antenna: *mut c_char,
}

#[repr(C)]
struct UhdUsrpTxInfo {
    mboard_id: *mut c_char,
    mboard_name: *mut c_char,
    mboard_serial: *mut c_char,
    tx_id: *mut c_char,
    tx_subdev_name: *mut c_char,
    tx_subdev_spec: *mut c_char,
    tx_serial: *mut c_char,
    tx_antenna: *mut c_char,
}

unsafe extern "C" {
    fn uhd_get_last_error(error_out: *mut c_char, strbuffer_len: usize) -> UhdError;

    fn uhd_usrp_make(h: *mut UhdUsrpHandle, args: *const c_char) -> UhdError;
    fn uhd_usrp_free(h: *mut UhdUsrpHandle) -> UhdError;
    fn uhd_usrp_set_clock_source(
        h: UhdUsrpHandle,
        source: *const c_char,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_set_time_source(
        h: UhdUsrpHandle,
        source: *const c_char,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_set_gpio_attr(
        h: UhdUsrpHandle,
        bank: *const c_char,
        attr: *const c_char,
        value: u32,
        mask: u32,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_get_rx_info(
        h: UhdUsrpHandle,
        chan: usize,
        info_out: *mut UhdUsrpRxInfo,
    ) -> UhdError;
    fn uhd_usrp_rx_info_free(info: *mut UhdUsrpRxInfo) -> UhdError;
    fn uhd_usrp_get_tx_info(
        h: UhdUsrpHandle,
        chan: usize,
        info_out: *mut UhdUsrpTxInfo,
    ) -> UhdError;
    fn uhd_usrp_tx_info_free(info: *mut UhdUsrpTxInfo) -> UhdError;
    fn uhd_usrp_set_rx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_set_tx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_set_time_next_pps(
        h: UhdUsrpHandle,
        full_secs: i64,
        frac_secs: c_double,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_set_command_time(
        h: UhdUsrpHandle,
        full_secs: i64,
        frac_secs: c_double,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_clear_command_time(h: UhdUsrpHandle, mboard: usize) -> UhdError;
    fn uhd_usrp_get_rx_stream(
        h: UhdUsrpHandle,
        stream_args: *mut UhdStreamArgs,
        h_out: UhdRxStreamerHandle,
    ) -> UhdError;
    fn uhd_usrp_get_tx_stream(
        h: UhdUsrpHandle,
        stream_args: *mut UhdStreamArgs,
        h_out: UhdTxStreamerHandle,
    ) -> UhdError;

    fn uhd_rx_streamer_make(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_free(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_max_num_samps(
        h: UhdRxStreamerHandle,
        max_num_samps_out: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_recv(
        h: UhdRxStreamerHandle,
        buffs: *mut *mut c_void,
        samps_per_buff: usize,
        md: *mut UhdRxMetadataHandle,
        timeout: c_double,
        one_packet: bool,
        items_recvd: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_issue_stream_cmd(
        h: UhdRxStreamerHandle,
        stream_cmd: *const UhdStreamCmd,
    ) -> UhdError;

    fn uhd_rx_metadata_make(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_free(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_error_code(h: UhdRxMetadataHandle, error_code_out: *mut c_int) -> UhdError;
    fn uhd_rx_metadata_end_of_burst(h: UhdRxMetadataHandle, result_out: *mut bool) -> UhdError;

    fn uhd_tx_streamer_make(h: *mut UhdTxStreamerHandle) -> UhdError;
    fn uhd_tx_streamer_free(h: *mut UhdTxStreamerHandle) -> UhdError;
    fn uhd_tx_streamer_max_num_samps(
        h: UhdTxStreamerHandle,
        max_num_samps_out: *mut usize,
    ) -> UhdError;
    fn uhd_tx_streamer_send(
        h: UhdTxStreamerHandle,
        buffs: *mut *const c_void,
        samps_per_buff: usize,
        md: *mut UhdTxMetadataHandle,
        timeout: c_double,
        items_sent: *mut usize,
    ) -> UhdError;

    fn uhd_tx_metadata_make(
        handle: *mut UhdTxMetadataHandle,
        has_time_spec: bool,
        full_secs: i64,
        frac_secs: c_double,
        start_of_burst: bool,
        end_of_burst: bool,
    ) -> UhdError;
    fn uhd_tx_metadata_free(handle: *mut UhdTxMetadataHandle) -> UhdError;
}

/// Turn a UHD return code into a `Result`, attaching the driver's last error.
fn check(err: UhdError, call: &str) -> Result<()> {
    if err == UHD_ERROR_NONE {
        return Ok(());
    }
    let mut buf = vec![0u8; 512];
    // SAFETY: buffer is valid for buf.len() bytes and UHD NUL-terminates it.
    let detail = unsafe {
        uhd_get_last_error(buf.as_mut_ptr() as *mut c_char, buf.len());
        CStr::from_ptr(buf.as_ptr() as *const c_char)
            .to_string_lossy()
            .into_owned()
    };
    Err(anyhow::anyhow!("{} failed: error {} ({})", call, err, detail.trim()))
}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| anyhow::anyhow!("CString error: {}", e))
}

/// Owns the `uhd_usrp_handle`; streams keep it alive through an `Rc`.
struct UsrpPtr(UhdUsrpHandle);

impl Drop for UsrpPtr {
    fn drop(&mut self) {
        // SAFETY: handle came from uhd_usrp_make and is freed exactly once.
        unsafe {
            uhd_usrp_free(&mut self.0);
        }
    }
}

pub struct UhdDevice {
    usrp: Rc<UsrpPtr>,
}

impl UhdDevice {
    pub fn open(args: &str) -> Result<Self> {
        let c_args = c_string(args)?;
        let mut handle: UhdUsrpHandle = ptr::null_mut();
        // SAFETY: out-pointer is valid, args is NUL-terminated.
        unsafe {
            check(uhd_usrp_make(&mut handle, c_args.as_ptr()), "uhd_usrp_make")?;
        }
        Ok(Self {
            usrp: Rc::new(UsrpPtr(handle)),
        })
    }

    fn raw(&self) -> UhdUsrpHandle {
        self.usrp.0
    }

    fn stream_args(
        channels: &mut [usize],
        cpu: &CString,
        otw: &CString,
        extra: &CString,
    ) -> UhdStreamArgs {
        UhdStreamArgs {
            cpu_format: cpu.as_ptr() as *mut c_char,
            otw_format: otw.as_ptr() as *mut c_char,
            args: extra.as_ptr() as *mut c_char,
            channel_list: channels.as_mut_ptr(),
            n_channels: channels.len() as c_int,
        }
    }
}

fn owned_c_str(p: *const c_char) -> String {
    if p.is_null() {
        return String::new();
    }
    // SAFETY: non-null pointers in the info structs are NUL-terminated strings
    // owned by UHD until the matching *_info_free call.
    unsafe { CStr::from_ptr(p).to_string_lossy().into_owned() }
}

impl SdrDevice for UhdDevice {
    fn set_clock_source(&mut self, source: &str) -> Result<()> {
        let s = c_string(source)?;
        // SAFETY: live handle, NUL-terminated source.
        let err = unsafe { uhd_usrp_set_clock_source(self.raw(), s.as_ptr(), MBOARD) };
        check(err, "uhd_usrp_set_clock_source")
    }

    fn set_time_source(&mut self, source: &str) -> Result<()> {
        let s = c_string(source)?;
        // SAFETY: live handle, NUL-terminated source.
        let err = unsafe { uhd_usrp_set_time_source(self.raw(), s.as_ptr(), MBOARD) };
        check(err, "uhd_usrp_set_time_source")
    }

    fn set_gpio_attr(&mut self, bank: &str, attr: GpioAttr, value: u32, mask: u32) -> Result<()> {
        let b = c_string(bank)?;
        let a = c_string(attr.as_str())?;
        // SAFETY: live handle, NUL-terminated bank and attribute names.
        let err = unsafe {
            uhd_usrp_set_gpio_attr(self.raw(), b.as_ptr(), a.as_ptr(), value, mask, MBOARD)
        };
        check(err, "uhd_usrp_set_gpio_attr")
    }

    fn serial(&mut self, direction: Direction) -> Result<String> {
        // SAFETY: the info structs are plain C structs of pointers, valid when
        // zeroed; UHD fills them and the matching free call releases them.
        unsafe {
            match direction {
                Direction::Rx => {
                    let mut info: UhdUsrpRxInfo = std::mem::zeroed();
                    check(uhd_usrp_get_rx_info(self.raw(), 0, &mut info), "uhd_usrp_get_rx_info")?;
                    let serial = owned_c_str(info.mboard_serial);
                    check(uhd_usrp_rx_info_free(&mut info), "uhd_usrp_rx_info_free")?;
                    Ok(serial)
                }
                Direction::Tx => {
                    let mut info: UhdUsrpTxInfo = std::mem::zeroed();
                    check(uhd_usrp_get_tx_info(self.raw(), 0, &mut info), "uhd_usrp_get_tx_info")?;
                    let serial = owned_c_str(info.mboard_serial);
                    check(uhd_usrp_tx_info_free(&mut info), "uhd_usrp_tx_info_free")?;
                    Ok(serial)
                }
            }
        }
    }

    fn set_rate(&mut self, direction: Direction, rate: f64, channel: usize) -> Result<()> {
        match direction {
            Direction::Rx => {
                // SAFETY: live handle, scalar arguments only.
                let err = unsafe { uhd_usrp_set_rx_rate(self.raw(), rate, channel) };
                check(err, "uhd_usrp_set_rx_rate")
            }
            Direction::Tx => {
                // SAFETY: live handle, scalar arguments only.
                let err = unsafe { uhd_usrp_set_tx_rate(self.raw(), rate, channel) };
                check(err, "uhd_usrp_set_tx_rate")
            }
        }
    }

    fn set_time_next_pps(&mut self, time: TimeSpec) -> Result<()> {
        // SAFETY: live handle, scalar arguments only.
        let err = unsafe {
            uhd_usrp_set_time_next_pps(self.raw(), time.full_secs, time.frac_secs, MBOARD)
        };
        check(err, "uhd_usrp_set_time_next_pps")
    }

    fn set_command_time(&mut self, time: TimeSpec) -> Result<()> {
        // SAFETY: live handle, scalar arguments only.
        let err = unsafe {
            uhd_usrp_set_command_time(self.raw(), time.full_secs, time.frac_secs, MBOARD)
        };
        check(err, "uhd_usrp_set_command_time")
    }

    fn clear_command_time(&mut self) -> Result<()> {
        // SAFETY: live handle.
        let err = unsafe { uhd_usrp_clear_command_time(self.raw(), MBOARD) };
        check(err, "uhd_usrp_clear_command_time")
    }

    fn rx_stream(&mut self, channels: &[usize]) -> Result<Box<dyn RxStream>> {
        let cpu = c_string("sc16")?;
        let otw = c_string("sc16")?;
        let extra = c_string("")?;
        let mut chans = channels.to_vec();
        let mut args = Self::stream_args(&mut chans, &cpu, &otw, &extra);

        let mut stream = UhdRxStream {
            handle: ptr::null_mut(),
            md: ptr::null_mut(),
            max_samps: 0,
            _usrp: self.usrp.clone(),
        };
        // SAFETY: out-pointers are valid; `stream` frees whatever was made if a
        // later call fails; `args` and the strings it points into outlive the calls.
        unsafe {
            check(uhd_rx_streamer_make(&mut stream.handle), "uhd_rx_streamer_make")?;
            check(uhd_rx_metadata_make(&mut stream.md), "uhd_rx_metadata_make")?;
            check(
                uhd_usrp_get_rx_stream(self.raw(), &mut args, stream.handle),
                "uhd_usrp_get_rx_stream",
            )?;
            check(
                uhd_rx_streamer_max_num_samps(stream.handle, &mut stream.max_samps),
                "uhd_rx_streamer_max_num_samps",
            )?;
        }
        if stream.max_samps == 0 {
            return Err(anyhow::anyhow!("rx stream reports 0 samples per packet"));
        }
        tracing::info!("rx stream max_num_samps: {}", stream.max_samps);
        Ok(Box::new(stream))
    }

    fn tx_stream(&mut self, channels: &[usize]) -> Result<Box<dyn TxStream>> {
        let cpu = c_string("sc16")?;
        let otw = c_string("sc16")?;
        let extra = c_string("")?;
        let mut chans = channels.to_vec();
        let mut args = Self::stream_args(&mut chans, &cpu, &otw, &extra);

        let mut stream = UhdTxStream {
            handle: ptr::null_mut(),
            max_samps: 0,
            _usrp: self.usrp.clone(),
        };
        // SAFETY: as for rx_stream.
        unsafe {
            check(uhd_tx_streamer_make(&mut stream.handle), "uhd_tx_streamer_make")?;
            check(
                uhd_usrp_get_tx_stream(self.raw(), &mut args, stream.handle),
                "uhd_usrp_get_tx_stream",
            )?;
            check(
                uhd_tx_streamer_max_num_samps(stream.handle, &mut stream.max_samps),
                "uhd_tx_streamer_max_num_samps",
            )?;
        }
        if stream.max_samps == 0 {
            return Err(anyhow::anyhow!("tx stream reports 0 samples per packet"));
        }
        tracing::info!("tx stream max_num_samps: {}", stream.max_samps);
        Ok(Box::new(stream))
    }
}

struct UhdRxStream {
    handle: UhdRxStreamerHandle,
    md: UhdRxMetadataHandle,
    max_samps: usize,
    _usrp: Rc<UsrpPtr>,
}

impl RxStream for UhdRxStream {
    fn max_samples_per_packet(&self) -> usize {
        self.max_samps
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<()> {
        let (mode, num_samps, at) = match cmd {
            StreamCommand::StartContinuous { at } => (UHD_STREAM_MODE_START_CONTINUOUS, 0, at),
            StreamCommand::NumSamplesAndDone { samples, at } => {
                (UHD_STREAM_MODE_NUM_SAMPS_AND_DONE, samples, at)
            }
            StreamCommand::StopContinuous => (UHD_STREAM_MODE_STOP_CONTINUOUS, 0, None),
        };
        let time = at.unwrap_or(TimeSpec::ZERO);
        let raw = UhdStreamCmd {
            stream_mode: mode,
            num_samps,
            stream_now: at.is_none(),
            time_spec_full_secs: time.full_secs,
            time_spec_frac_secs: time.frac_secs,
        };
        // SAFETY: live streamer, `raw` outlives the call.
        let err = unsafe { uhd_rx_streamer_issue_stream_cmd(self.handle, &raw) };
        check(err, "uhd_rx_streamer_issue_stream_cmd")
    }

    fn recv(&mut self, buffers: &mut [Vec<Sc16>], timeout: Duration) -> Result<RecvOutcome> {
        let samps = buffers.iter().map(|b| b.len()).min().unwrap_or(0);
        let mut ptrs: Vec<*mut c_void> = buffers
            .iter_mut()
            .map(|b| b.as_mut_ptr() as *mut c_void)
            .collect();
        let mut received = 0usize;
        let mut error_code: c_int = 0;
        let mut end_of_burst = false;

        // SAFETY: one pointer per stream channel, each buffer holds at least
        // `samps` samples; metadata handle is owned by this stream.
        unsafe {
            check(
                uhd_rx_streamer_recv(
                    self.handle,
                    ptrs.as_mut_ptr(),
                    samps,
                    &mut self.md,
                    timeout.as_secs_f64(),
                    false,
                    &mut received,
                ),
                "uhd_rx_streamer_recv",
            )?;
            check(
                uhd_rx_metadata_error_code(self.md, &mut error_code),
                "uhd_rx_metadata_error_code",
            )?;
            check(
                uhd_rx_metadata_end_of_burst(self.md, &mut end_of_burst),
                "uhd_rx_metadata_end_of_burst",
            )?;
        }

        match error_code {
            UHD_RX_METADATA_ERROR_CODE_NONE => {}
            UHD_RX_METADATA_ERROR_CODE_OVERFLOW => {}
            UHD_RX_METADATA_ERROR_CODE_TIMEOUT => {
                return Err(anyhow::anyhow!("receive timed out after {:?}", timeout));
            }
            other => {
                return Err(anyhow::anyhow!("USRP streaming error: 0x{:x}", other));
            }
        }

        Ok(RecvOutcome {
            samples: received,
            overflow: error_code == UHD_RX_METADATA_ERROR_CODE_OVERFLOW,
            end_of_burst,
        })
    }
}

impl Drop for UhdRxStream {
    fn drop(&mut self) {
        // SAFETY: handles are null or came from the matching make call.
        unsafe {
            if !self.md.is_null() {
                uhd_rx_metadata_free(&mut self.md);
            }
            if !self.handle.is_null() {
                uhd_rx_streamer_free(&mut self.handle);
            }
        }
    }
}

struct UhdTxStream {
    handle: UhdTxStreamerHandle,
    max_samps: usize,
    _usrp: Rc<UsrpPtr>,
}

impl TxStream for UhdTxStream {
    fn max_samples_per_packet(&self) -> usize {
        self.max_samps
    }

    fn send(&mut self, buffers: &[&[Sc16]], md: TxMetadata, timeout: Duration) -> Result<usize> {
        let samps = buffers.iter().map(|b| b.len()).min().unwrap_or(0);
        let mut ptrs: Vec<*const c_void> = buffers
            .iter()
            .map(|b| b.as_ptr() as *const c_void)
            .collect();
        let time = md.at.unwrap_or(TimeSpec::ZERO);
        let mut sent = 0usize;

        // SAFETY: one pointer per stream channel, each slice holds at least
        // `samps` samples; the metadata handle is freed before returning.
        unsafe {
            let mut raw_md: UhdTxMetadataHandle = ptr::null_mut();
            check(
                uhd_tx_metadata_make(
                    &mut raw_md,
                    md.at.is_some(),
                    time.full_secs,
                    time.frac_secs,
                    md.start_of_burst,
                    md.end_of_burst,
                ),
                "uhd_tx_metadata_make",
            )?;
            let result = check(
                uhd_tx_streamer_send(
                    self.handle,
                    ptrs.as_mut_ptr(),
                    samps,
                    &mut raw_md,
                    timeout.as_secs_f64(),
                    &mut sent,
                ),
                "uhd_tx_streamer_send",
            );
            let freed = check(uhd_tx_metadata_free(&mut raw_md), "uhd_tx_metadata_free");
            result?;
            freed?;
        }
        Ok(sent)
    }
}

impl Drop for UhdTxStream {
    fn drop(&mut self) {
        // SAFETY: handle is null or came from uhd_tx_streamer_make.
        unsafe {
            if !self.handle.is_null() {
                uhd_tx_streamer_free(&mut self.handle);
            }
        }
    }
}
