//! Parsers for `MLSD`/`MLST` facts and Unix-style `LIST` output.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKind {
    File,
    Dir,
    /// `cdir`/`pdir` entries naming the listed directory or its parent.
    SelfOrParent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listed {
    pub name: String,
    pub kind: FactKind,
    pub size: u64,
    pub modified: i64,
}

/// One `MLSD` line or the fact line of an `MLST` reply.
pub fn parse_facts(line: &str) -> Option<Listed> {
    let line = line.trim_start();
    let (facts, name) = line.split_once(' ')?;
    let mut listed = Listed {
        name: name.to_string(),
        kind: FactKind::File,
        size: 0,
        modified: 0,
    };
    for fact in facts.split(';').filter(|fact| !fact.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                listed.kind = match value.to_ascii_lowercase().as_str() {
                    "dir" => FactKind::Dir,
                    "cdir" | "pdir" => FactKind::SelfOrParent,
                    _ => FactKind::File,
                }
            }
            "size" => listed.size = value.parse().unwrap_or(0),
            "modify" => listed.modified = parse_timeval(value).unwrap_or(0),
            _ => {}
        }
    }
    Some(listed)
}

/// `YYYYMMDDHHMMSS[.sss]` in UTC, as used by `MDTM` and the `modify` fact.
pub fn parse_timeval(value: &str) -> Option<i64> {
    let value = value.trim();
    let (main, fraction) = match value.split_once('.') {
        Some((main, fraction)) => (main, Some(fraction)),
        None => (value, None),
    };
    if main.len() != 14 || !main.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = |range: std::ops::Range<usize>| main[range].parse::<u16>().ok();
    let year = i32::from(number(0..4)?);
    let month = Month::try_from(number(4..6)? as u8).ok()?;
    let day = number(6..8)? as u8;
    let millis = match fraction {
        Some(fraction) => {
            let digits: String = fraction.chars().take(3).collect();
            format!("{digits:0<3}").parse::<u16>().ok()?
        }
        None => 0,
    };
    let time = Time::from_hms_milli(
        number(8..10)? as u8,
        number(10..12)? as u8,
        number(12..14)? as u8,
        millis,
    )
    .ok()?;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    let stamp = PrimitiveDateTime::new(date, time).assume_utc();
    Some(stamp.unix_timestamp() * 1000 + i64::from(millis))
}

/// One line of Unix `ls -l` style `LIST` output.
pub fn parse_list_line(line: &str, now: OffsetDateTime) -> Option<Listed> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(8);
    for _ in 0..8 {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    let name = rest.trim_end_matches(['\r', '\n']);
    if name.is_empty() {
        return None;
    }

    let permissions = fields[0];
    let kind = match permissions.chars().next()? {
        'd' => FactKind::Dir,
        '-' | 'l' => FactKind::File,
        _ => return None,
    };
    if permissions.len() < 10 {
        return None;
    }
    let name = if permissions.starts_with('l') {
        name.split(" -> ").next().unwrap_or(name)
    } else {
        name
    };
    if name == "." || name == ".." {
        return None;
    }

    Some(Listed {
        name: name.to_string(),
        kind,
        size: if kind == FactKind::Dir {
            0
        } else {
            fields[4].parse().unwrap_or(0)
        },
        modified: parse_list_date(fields[5], fields[6], fields[7], now).unwrap_or(0),
    })
}

fn parse_list_date(month: &str, day: &str, tail: &str, now: OffsetDateTime) -> Option<i64> {
    let month = match month.to_ascii_lowercase().as_str() {
        "jan" => Month::January,
        "feb" => Month::February,
        "mar" => Month::March,
        "apr" => Month::April,
        "may" => Month::May,
        "jun" => Month::June,
        "jul" => Month::July,
        "aug" => Month::August,
        "sep" => Month::September,
        "oct" => Month::October,
        "nov" => Month::November,
        "dec" => Month::December,
        _ => return None,
    };
    let day: u8 = day.parse().ok()?;
    let stamp = match tail.split_once(':') {
        Some((hour, minute)) => {
            let time = Time::from_hms(hour.parse().ok()?, minute.parse().ok()?, 0).ok()?;
            let this_year = PrimitiveDateTime::new(
                Date::from_calendar_date(now.year(), month, day).ok()?,
                time,
            )
            .assume_utc();
            // recent entries omit the year; a date in the future means last year
            if this_year > now + time::Duration::days(1) {
                PrimitiveDateTime::new(
                    Date::from_calendar_date(now.year() - 1, month, day).ok()?,
                    time,
                )
                .assume_utc()
            } else {
                this_year
            }
        }
        None => {
            let year: i32 = tail.parse().ok()?;
            PrimitiveDateTime::new(Date::from_calendar_date(year, month, day).ok()?, Time::MIDNIGHT)
                .assume_utc()
        }
    };
    Some(stamp.unix_timestamp() * 1000)
}
