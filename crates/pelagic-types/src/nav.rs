//! Composite navigation solution data.

/// No position fix.
pub const FIX_TYPE_NONE: u8 = 0;
/// Two-dimensional fix.
pub const FIX_TYPE_2D: u8 = 2;
/// Three-dimensional fix.
pub const FIX_TYPE_3D: u8 = 3;

/// `valid` flag: the UTC date is resolved.
pub const VALID_DATE: u8 = 0x01;
/// `valid` flag: the UTC time of day is resolved.
pub const VALID_TIME: u8 = 0x02;

/// One navigation solution, assembled from the PVT, DOP and STATUS messages
/// that share the same time-of-week tag.
///
/// Scaled fields carry engineering units: positions in degrees, headings in
/// degrees, DOPs dimensionless. Unscaled fields keep the receiver's native
/// units (mm, mm/s, ms) so nothing is lost for logging.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GnssFix {
    pub itow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    pub valid: u8,
    pub t_acc: u32,
    pub nano: i32,
    pub fix_type: u8,
    pub flags: u8,
    pub flags2: u8,
    pub num_sv: u8,
    /// Longitude in degrees.
    pub lon: f64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Height above ellipsoid, mm.
    pub height: i32,
    /// Height above mean sea level, mm.
    pub h_msl: i32,
    /// Horizontal accuracy estimate, mm.
    pub h_acc: u32,
    /// Vertical accuracy estimate, mm.
    pub v_acc: u32,
    pub vel_n: i32,
    pub vel_e: i32,
    pub vel_d: i32,
    /// Ground speed, mm/s.
    pub g_speed: i32,
    /// Heading of motion, degrees.
    pub head_mot: f32,
    pub s_acc: u32,
    pub head_acc: f32,
    pub p_dop: f32,
    pub v_dop: f32,
    pub h_dop: f32,
    /// Heading of vehicle, degrees.
    pub head_veh: f32,
    /// Time to first fix, ms.
    pub ttff: u32,
}

impl GnssFix {
    /// True when the solution carries a usable 2D or 3D position.
    pub fn has_position(&self) -> bool {
        self.fix_type == FIX_TYPE_2D || self.fix_type == FIX_TYPE_3D
    }

    /// True when both the date and time-of-day flags are set.
    pub fn has_valid_datetime(&self) -> bool {
        self.valid & (VALID_DATE | VALID_TIME) == (VALID_DATE | VALID_TIME)
    }
}
