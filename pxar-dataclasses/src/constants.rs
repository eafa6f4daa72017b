//! Hardware constants of the pixel module and the DTB
//!
//! The pixel unit cell grid is fixed by the ROC layout, the
//! DAQ buffer size by the DTB memory reserved for the event
//! stream. Flags are a bitmask passed through the test
//! functions down to the firmware loops.

/// Number of pixel columns on one ROC
pub const ROC_NUMCOLS   : u8 = 52;
/// Number of pixel rows on one ROC
pub const ROC_NUMROWS   : u8 = 80;
/// Number of pixel unit cells on one ROC
pub const ROC_NUMPIXELS : u16 = 4160;

/// Number of double columns on one ROC
pub const ROC_NUMDCOLS  : u8 = 26;

/// DTB memory reserved for the DAQ event stream, in 16bit words.
/// The DAQ status call reports against this capacity.
pub const DTB_SOURCE_BUFFER_SIZE : u32 = 100_000_000;

/// Warn and report failure when the DAQ buffer exceeds this fill fraction
pub const DTB_BUFFER_OVERFLOW_FRACTION : f32 = 0.9;

/// Maximum number of pattern generator commands the DTB can hold
pub const PG_MAX_CMDS : usize = 256;

// Test flags. The lower bits are interpreted by the core, anything
// else is passed through to the firmware loops untouched.
pub const FLAG_FORCE_SERIAL   : u16 = 0x0001; // no multi-ROC HAL calls
pub const FLAG_CALS           : u16 = 0x0002;
pub const FLAG_XTALK          : u16 = 0x0004;
pub const FLAG_RISING_EDGE    : u16 = 0x0008; // threshold search low -> high
pub const FLAG_DISABLE_DACCAL : u16 = 0x0010;
pub const FLAG_NOSORT         : u16 = 0x0020; // skip final sort of results
pub const FLAG_CHECK_ORDER    : u16 = 0x0040; // verify column-major pixel order
pub const FLAG_FORCE_UNMASKED : u16 = 0x0080; // do not mask pixels outside the swept set

// Pattern generator signal bits. Signals on the same PG entry are
// OR-combined into one pattern word.
pub const PG_NONE : u16 = 0x0000;
pub const PG_TOK  : u16 = 0x0100;
pub const PG_TRG  : u16 = 0x0200;
pub const PG_CAL  : u16 = 0x0400;
pub const PG_RESR : u16 = 0x0800;
pub const PG_REST : u16 = 0x1000;
pub const PG_SYNC : u16 = 0x2000;

// Testboard power limits [V]/[A]. Caller supplied settings get
// clamped against these.
pub const POWER_LIMIT_VA : f64 = 2.5;
pub const POWER_LIMIT_VD : f64 = 3.0;
pub const POWER_LIMIT_IA : f64 = 3.0;
pub const POWER_LIMIT_ID : f64 = 3.0;

/// Anything below this after clamping means the DUT can not be powered
pub const POWER_MINIMUM : f64 = 0.01;

/// DTB delay register holding the deserializer phase, needed at daqStart
pub const SIG_DESER160PHASE : u8 = 4;
