//! OPL chip support: frequency maths, patch handling and event conversion

mod converter;
mod util;

pub use converter::{OplConverter, OplEvent, OplSink, OplWrite, OplWriteFlags};
pub use util::{
    channel_for_op_offset, fnum_to_millihertz, lin_velocity_to_log_volume,
    log_volume_to_lin_velocity, millihertz_to_fnum, op_offset_car, op_offset_mod,
    opl_denormalise_perc, opl_normalise_perc, OplNormaliseType, BASE_ATCK_DCAY, BASE_CHAR_MULT,
    BASE_FEED_CONN, BASE_FNUM_L, BASE_KEYON_FREQ, BASE_RHYTHM, BASE_SCAL_LEVL, BASE_SUST_RLSE,
    BASE_WAVE, OPLBIT_KEYON, OPL_FNUM_DEFAULT, OPL_FNUM_ROUND, OPL_MAX_CHANNELS, OPL_NUM_CHIPS,
};
