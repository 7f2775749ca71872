use chrono::{NaiveDate, NaiveDateTime};

/// Records stamped with this are left over from a pump reset.
pub(crate) fn reset_date() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(2012, 1, 1)?.and_hms_opt(0, 0, 0)
}

/// Decode a packed 4- or 5-byte pump date.
///
/// The 5-byte form is `[second, minute, hour, day, year]`, the 4-byte form
/// `[year, day, minute, hour]` with seconds fixed at zero. In both, the month
/// is split over the top two bits of two bytes and the year is stored as an
/// offset from 2000. A zero year means the date was never set.
pub fn decode_date(payload: &[u8]) -> Option<NaiveDateTime> {
    let (second, minute, hour, day, month, year) = match *payload {
        [y, d, m, h] => (
            0,
            m & 0x3F,
            h & 0x1F,
            d & 0x1F,
            ((h & 0xC0) >> 4) | ((m & 0xC0) >> 6),
            y,
        ),
        [s, m, h, d, y, ..] => (
            s & 0x3F,
            m & 0x3F,
            h & 0x1F,
            d & 0x1F,
            ((s & 0xC0) >> 4) | ((m & 0xC0) >> 6),
            y,
        ),
        _ => return None,
    };

    let year = (year & 0x7F) as i32 + 2000;
    if year == 2000 {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)?.and_hms_opt(
        hour as u32,
        minute as u32,
        second as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn five_byte_date() {
        // 2016-11-14 10:42:05; month 11 = 0b1011 split as 10|11
        let payload = [0x80 | 5, 0xC0 | 42, 10, 14, 16];
        assert_eq!(decode_date(&payload), Some(dt(2016, 11, 14, 10, 42, 5)));
    }

    #[test]
    fn four_byte_date_has_no_seconds() {
        // 2017-03-02 23:15; month 3 = 0b0011 split as 00|11
        let payload = [17, 2, 0xC0 | 15, 23];
        assert_eq!(decode_date(&payload), Some(dt(2017, 3, 2, 23, 15, 0)));
    }

    #[test]
    fn unset_year_is_no_date() {
        assert_eq!(decode_date(&[0x40, 0x40, 1, 1, 0]), None);
        assert_eq!(decode_date(&[0x80, 0x40, 1, 1, 0x80]), None);
    }

    #[test]
    fn short_or_invalid_payload_is_no_date() {
        assert_eq!(decode_date(&[1, 2, 3]), None);
        // month zero
        assert_eq!(decode_date(&[0, 0, 1, 1, 16]), None);
    }
}
