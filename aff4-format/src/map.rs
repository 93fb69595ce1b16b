//! Map streams: a byte range defined piecewise over other streams.
//!
//! A map holds a list of points sorted by image offset. Each point says
//! "from here on, byte `image_offset` of the map is byte `target_offset` of
//! target `target`", and the mapping continues linearly up to the next
//! point. Optional `aff4:image_period`/`aff4:target_period` attributes tile
//! the same points over and over, shifting the target offset by one target
//! period per repetition.
//!
//! Persisted as `<map>/map`, one `image_offset,target_offset,target_urn`
//! line per point. Data written into a map lands in `<map>/data`.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::attrs;
use crate::compression::Compression;
use crate::de;
use crate::error::{Error, Result};
use crate::object::{Handle, Mode, Object, ObjectType, Stream};
use crate::resolver::Resolver;
use crate::segment::Segment;
use crate::ser;
use crate::urn::Urn;
use crate::volume::ZipVolume;

const MAP_MEMBER: &str = "map";
const DATA_MEMBER: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub image_offset: u64,
    pub target_offset: u64,
    /// Index into [`MapStream::targets`].
    pub target: usize,
}

/// Where a map offset lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpolated {
    pub target_offset: u64,
    /// Bytes from here on that map contiguously into the same target.
    pub available: u64,
    pub target: usize,
}

/// Drop every point whose target offset follows linearly from the point
/// kept before it. Points out of image offset order are always kept.
pub fn pack(points: &[Point]) -> Vec<Point> {
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for &point in points {
        if let Some(last) = out.last() {
            let predicted = point
                .image_offset
                .checked_sub(last.image_offset)
                .and_then(|delta| last.target_offset.checked_add(delta));
            if last.target == point.target && predicted == Some(point.target_offset) {
                continue;
            }
        }
        out.push(point);
    }
    out
}

/// Insert `point` after every point at or before its image offset, so that
/// of several points at one offset the latest takes effect.
fn insert_point(points: &mut Vec<Point>, point: Point) {
    let at = points.partition_point(|p| p.image_offset <= point.image_offset);
    points.insert(at, point);
}

/// Keep only the last point at each image offset.
fn effective_points(points: &[Point]) -> Vec<Point> {
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for &point in points {
        match out.last_mut() {
            Some(last) if last.image_offset == point.image_offset => *last = point,
            _ => out.push(point),
        }
    }
    out
}

#[derive(Debug)]
pub struct MapStream {
    urn: Urn,
    mode: Mode,
    resolver: Resolver,
    volume: Urn,
    targets: Vec<Urn>,
    points: Vec<Point>,
    size: u64,
    pos: u64,
    image_period: Option<u64>,
    target_period: Option<u64>,
    data: Option<Handle<Segment>>,
    closed: bool,
}

impl MapStream {
    pub(crate) fn construct(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let volume = resolver.require_urn(urn, attrs::STORED)?;
        let map_member = urn.append(MAP_MEMBER);

        let (size, targets, points) = match mode {
            Mode::Read => {
                let size = resolver.require_u64(urn, attrs::SIZE)?;
                let (targets, points) = MapStream::load_points(resolver, &map_member)?;
                (size, targets, points)
            }
            Mode::Write if resolver.has_subject(&map_member) => {
                let size = resolver.resolve_u64(urn, attrs::SIZE).unwrap_or(0);
                let (targets, points) = MapStream::load_points(resolver, &map_member)?;
                (size, targets, points)
            }
            Mode::Write => {
                let size = resolver.resolve_u64(urn, attrs::SIZE).unwrap_or(0);
                resolver.set(urn, attrs::SIZE, size);
                (size, vec![], vec![])
            }
        };

        let image_period = resolver.resolve_u64(urn, attrs::IMAGE_PERIOD).filter(|&p| p > 0);
        let target_period = resolver.resolve_u64(urn, attrs::TARGET_PERIOD);

        tracing::debug!(urn = %urn, ?mode, points = points.len(), size, "opened map");
        Ok(Box::new(MapStream {
            urn: urn.clone(),
            mode,
            resolver: resolver.clone(),
            volume,
            targets,
            points,
            size,
            pos: 0,
            image_period,
            target_period,
            data: None,
            closed: false,
        }))
    }

    fn load_points(resolver: &Resolver, member: &Urn) -> Result<(Vec<Urn>, Vec<Point>)> {
        let raw = Segment::read_all(resolver, member)?;
        let text = String::from_utf8(raw)
            .map_err(|_| Error::structural(format!("map {} is not text", member)))?;

        let mut targets: Vec<Urn> = vec![];
        let mut points = vec![];
        for (image_offset, target_offset, target) in de::parse_map(&text)? {
            let target = match targets.iter().position(|t| *t == target) {
                Some(i) => i,
                None => {
                    targets.push(target);
                    targets.len() - 1
                }
            };
            points.push(Point {
                image_offset,
                target_offset,
                target,
            });
        }
        points.sort_by_key(|p| p.image_offset);
        Ok((targets, points))
    }

    /// Start a new, empty map in `volume`.
    pub fn create_in(resolver: &Resolver, volume: &Urn) -> Result<Handle<MapStream>> {
        resolver
            .create(ObjectType::Map)
            .set(attrs::STORED, volume)
            .finish_as::<MapStream>()
    }

    pub fn targets(&self) -> &[Urn] {
        &self.targets
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    fn target_index(&mut self, target: &Urn) -> usize {
        match self.targets.iter().position(|t| t == target) {
            Some(i) => i,
            None => {
                self.targets.push(target.clone());
                self.targets.len() - 1
            }
        }
    }

    /// Map `image_offset` onward to `target_offset` of `target`.
    pub fn add_point(&mut self, image_offset: u64, target_offset: u64, target: &Urn) {
        let target = self.target_index(target);
        insert_point(
            &mut self.points,
            Point {
                image_offset,
                target_offset,
                target,
            },
        );
    }

    /// Remove points that add nothing to the mapping.
    pub fn pack(&mut self) {
        let before = self.points.len();
        self.points = pack(&effective_points(&self.points));
        tracing::trace!(urn = %self.urn, before, after = self.points.len(), "packed map");
    }

    /// Set the logical size, e.g. after describing the map with points only.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.resolver.set(&self.urn, attrs::SIZE, size);
    }

    fn period(&self) -> u64 {
        self.image_period.unwrap_or(self.size)
    }

    /// Translate a map offset.
    ///
    /// Offsets before the first point are mapped backwards from that point.
    /// An offset at or after the last point maps forward from it up to the
    /// end of the period.
    pub fn interpolate(&self, offset: u64) -> Result<Interpolated> {
        let period = self.period();
        let (period_number, in_period) = if period == 0 {
            (0, offset)
        } else {
            (offset / period, offset % period)
        };
        let shift = period_number
            .checked_mul(self.target_period.unwrap_or(period))
            .ok_or_else(|| Error::structural(format!("offset {} of {} overflows", offset, self.urn)))?;

        let idx = self.points.partition_point(|p| p.image_offset <= in_period);
        let (point, target_offset, available) = if idx == 0 {
            let next = self.points.first().ok_or_else(|| {
                Error::structural(format!("map {} has no points", self.urn))
            })?;
            let back = next.image_offset - in_period;
            let target_offset = next.target_offset.checked_sub(back).ok_or_else(|| {
                Error::structural(format!(
                    "offset {} of {} maps before the start of its target",
                    offset, self.urn
                ))
            })?;
            (next, target_offset, back)
        } else {
            let point = &self.points[idx - 1];
            let until = match self.points.get(idx) {
                Some(next) => next.image_offset,
                None => period.max(in_period),
            };
            (
                point,
                point.target_offset + (in_period - point.image_offset),
                until - in_period,
            )
        };

        Ok(Interpolated {
            target_offset: target_offset + shift,
            available,
            target: point.target,
        })
    }

    fn read_target(&mut self, target: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let urn = self
            .targets
            .get(target)
            .cloned()
            .ok_or_else(|| Error::structural(format!("map {} points at a missing target", self.urn)))?;

        if let Some(data) = self.data.as_mut() {
            if *data.urn() == urn {
                data.seek(SeekFrom::Start(offset))?;
                return Ok(data.read(buf)?);
            }
        }

        let mut handle = self.resolver.open(&urn, Mode::Read)?;
        let result = (|| -> Result<usize> {
            let stream = handle.stream()?;
            stream.seek(SeekFrom::Start(offset))?;
            Ok(stream.read(buf)?)
        })();
        self.resolver.cache_return(handle);
        result
    }

    fn data_segment(&mut self) -> Result<&mut Handle<Segment>> {
        if self.data.is_none() {
            let data_urn = self.urn.append(DATA_MEMBER);
            if self.resolver.has_subject(&data_urn) {
                return Err(Error::structural(format!(
                    "map {} already holds written data and cannot take more",
                    self.urn
                )));
            }
            let segment = self
                .resolver
                .create(ObjectType::Segment)
                .urn(data_urn)
                .set(attrs::STORED, &self.volume)
                .finish_as::<Segment>()?;
            self.data = Some(segment);
        }
        self.data
            .as_mut()
            .ok_or_else(|| Error::structural("map data segment vanished"))
    }

    fn write_at(&mut self, buf: &[u8]) -> Result<()> {
        if self.image_period.is_some() {
            return Err(Error::structural(format!(
                "periodic map {} cannot be written to",
                self.urn
            )));
        }
        let start = self.pos;
        let end = start + buf.len() as u64;

        // What `end` mapped to before this write.
        let restore = if end < self.size && !self.points.is_empty() {
            Some(self.interpolate(end)?)
        } else {
            None
        };

        let data = self.data_segment()?;
        let data_end = data.size();
        data.seek(SeekFrom::End(0))?;
        data.write_all(buf)?;
        let data_urn = data.urn().clone();
        let data_target = self.target_index(&data_urn);

        self.points
            .retain(|p| p.image_offset < start || p.image_offset >= end);
        if let Some(restore) = restore {
            if self.points.iter().all(|p| p.image_offset != end) {
                insert_point(
                    &mut self.points,
                    Point {
                        image_offset: end,
                        target_offset: restore.target_offset,
                        target: restore.target,
                    },
                );
            }
        }
        insert_point(
            &mut self.points,
            Point {
                image_offset: start,
                target_offset: data_end,
                target: data_target,
            },
        );

        self.pos = end;
        if end > self.size {
            self.set_size(end);
        }
        Ok(())
    }

    fn write_members(&mut self) -> Result<()> {
        let mut stored = effective_points(&self.points);
        stored.sort_by(|a, b| {
            (a.target_offset, &self.targets[a.target], a.image_offset).cmp(&(
                b.target_offset,
                &self.targets[b.target],
                b.image_offset,
            ))
        });
        let mut lines = String::new();
        for point in &stored {
            ser::write_map_line(
                &mut lines,
                point.image_offset,
                point.target_offset,
                &self.targets[point.target],
            );
        }

        let mut properties = String::new();
        if let Some(set) = self.resolver.properties(&self.urn) {
            ser::write_properties(&mut properties, &self.urn, &self.urn, &set);
        }

        let mut volume = self
            .resolver
            .open_as::<ZipVolume>(&self.volume, Mode::Write)?;
        let result = volume
            .writestr(&self.urn.append(MAP_MEMBER), lines.as_bytes(), Compression::Stored)
            .and_then(|_| {
                volume.writestr(
                    &self.urn.append("properties"),
                    properties.as_bytes(),
                    Compression::Stored,
                )
            });
        self.resolver.cache_return(volume);
        result
    }
}

impl Object for MapStream {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Map
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn close(&mut self) -> Result<()> {
        if self.mode != Mode::Write || self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(data) = self.data.take() {
            data.close()?;
        }
        self.resolver.set(&self.urn, attrs::SIZE, self.size);
        self.write_members()?;

        tracing::info!(
            urn = %self.urn,
            size = self.size,
            points = self.points.len(),
            targets = self.targets.len(),
            "closed map"
        );
        Ok(())
    }

    fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        Some(self)
    }
}

impl Read for MapStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() && self.pos < self.size {
            let at = self.interpolate(self.pos)?;
            let n = (buf.len() - done)
                .min(usize::try_from(at.available).unwrap_or(usize::MAX))
                .min(usize::try_from(self.size - self.pos).unwrap_or(usize::MAX));
            if n == 0 {
                break;
            }
            let got = self.read_target(at.target, at.target_offset, &mut buf[done..done + n])?;
            if got == 0 {
                break;
            }
            done += got;
            self.pos += got as u64;
        }
        Ok(done)
    }
}

impl Write for MapStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mode != Mode::Write || self.closed {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("map {} is not open for writing", self.urn),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.write_at(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MapStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.size.checked_add_signed(n),
            SeekFrom::Current(n) => self.pos.checked_add_signed(n),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;
        self.pos = target;
        Ok(target)
    }
}

impl Stream for MapStream {
    fn size(&self) -> u64 {
        self.size
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        if self.mode != Mode::Write {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("map {} is not open for writing", self.urn),
            ));
        }
        self.points.retain(|p| p.image_offset < len);
        self.set_size(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn point(image_offset: u64, target_offset: u64, target: usize) -> Point {
        Point {
            image_offset,
            target_offset,
            target,
        }
    }

    #[test]
    fn pack_keeps_points_out_of_order() {
        let points = [point(100, 100, 0), point(10, 10, 0), point(20, 20, 0)];
        assert_eq!(pack(&points), vec![point(100, 100, 0), point(10, 10, 0)]);
    }

    fn scratch(resolver: &Resolver) -> (tempfile::TempDir, Urn) {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_path(dir.path().join("map.zip")).unwrap();
        let volume = ZipVolume::create_in(resolver, &backing).unwrap();
        let urn = volume.urn().clone();
        resolver.cache_return(volume);
        (dir, urn)
    }

    fn bare_map(points: Vec<Point>, size: u64) -> MapStream {
        MapStream {
            urn: Urn::new("aff4://map"),
            mode: Mode::Read,
            resolver: Resolver::default(),
            volume: Urn::new("aff4://volume"),
            targets: vec![Urn::new("aff4://a"), Urn::new("aff4://b")],
            points,
            size,
            pos: 0,
            image_period: None,
            target_period: None,
            data: None,
            closed: false,
        }
    }

    #[test]
    fn pack_drops_linear_points_only() {
        let points = vec![point(0, 100, 0), point(10, 110, 0), point(20, 120, 1), point(30, 50, 1)];
        assert_eq!(pack(&points), vec![point(0, 100, 0), point(20, 120, 1), point(30, 50, 1)]);
    }

    #[test]
    fn later_points_win_at_equal_offsets() {
        let mut points = vec![];
        insert_point(&mut points, point(10, 0, 0));
        insert_point(&mut points, point(0, 0, 0));
        insert_point(&mut points, point(10, 500, 1));
        assert_eq!(points, vec![point(0, 0, 0), point(10, 0, 0), point(10, 500, 1)]);

        let map = bare_map(points, 100);
        let at = map.interpolate(12).unwrap();
        assert_eq!((at.target_offset, at.target, at.available), (502, 1, 88));
    }

    #[test]
    fn interpolation_boundaries() {
        let map = bare_map(vec![point(10, 100, 0), point(20, 300, 1)], 40);

        // Before the first point: backwards from it.
        let at = map.interpolate(4).unwrap();
        assert_eq!((at.target_offset, at.available, at.target), (94, 6, 0));

        // Exactly at a point.
        let at = map.interpolate(10).unwrap();
        assert_eq!((at.target_offset, at.available, at.target), (100, 10, 0));
        let at = map.interpolate(19).unwrap();
        assert_eq!((at.target_offset, at.available), (109, 1));

        // At and after the last point: runs to the end.
        let at = map.interpolate(20).unwrap();
        assert_eq!((at.target_offset, at.available, at.target), (300, 20, 1));
        let at = map.interpolate(39).unwrap();
        assert_eq!((at.target_offset, at.available), (319, 1));
    }

    #[test]
    fn backward_interpolation_cannot_underflow() {
        let map = bare_map(vec![point(10, 3, 0)], 20);
        assert_eq!(map.interpolate(7).unwrap().target_offset, 0);
        assert!(matches!(map.interpolate(6), Err(Error::Structural(_))));
    }

    #[test]
    fn periods_repeat_the_points() {
        let mut map = bare_map(vec![point(0, 0, 0), point(4, 0, 1)], 32);
        map.image_period = Some(8);
        map.target_period = Some(4);

        let at = map.interpolate(9).unwrap();
        assert_eq!((at.target_offset, at.available, at.target), (5, 3, 0));
        // The last point of a period runs to the period end, not the size.
        let at = map.interpolate(12).unwrap();
        assert_eq!((at.target_offset, at.available, at.target), (4, 4, 1));
        let at = map.interpolate(8 * 3 + 7).unwrap();
        assert_eq!((at.target_offset, at.available, at.target), (15, 1, 1));
    }

    #[test]
    fn empty_map_has_nothing_to_interpolate() {
        let map = bare_map(vec![], 10);
        assert!(map.interpolate(0).is_err());
    }

    #[test]
    fn reads_through_to_targets() {
        let resolver = Resolver::default();
        let (_dir, volume) = scratch(&resolver);
        let mut source = Segment::create_in(&resolver, &volume, "source").unwrap();
        source.write_all(b"0123456789").unwrap();
        let source_urn = source.urn().clone();
        source.close().unwrap();

        let mut map = MapStream::create_in(&resolver, &volume).unwrap();
        map.add_point(0, 5, &source_urn);
        map.add_point(5, 0, &source_urn);
        map.set_size(10);
        let urn = map.urn().clone();
        map.close().unwrap();

        let mut map = resolver.open_as::<MapStream>(&urn, Mode::Read).unwrap();
        let mut out = String::new();
        map.read_to_string(&mut out).unwrap();
        assert_eq!(out, "5678901234");
        resolver.cache_return(map);
        resolver.flush().unwrap();
    }

    #[test]
    fn short_target_stops_the_read() {
        let resolver = Resolver::default();
        let (_dir, volume) = scratch(&resolver);
        let mut source = Segment::create_in(&resolver, &volume, "short").unwrap();
        source.write_all(b"abc").unwrap();
        let source_urn = source.urn().clone();
        source.close().unwrap();

        let mut map = MapStream::create_in(&resolver, &volume).unwrap();
        map.add_point(0, 0, &source_urn);
        map.set_size(8);
        let mut out = vec![];
        map.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
        map.close().unwrap();
        resolver.flush().unwrap();
    }

    proptest! {
        #[test]
        fn pack_is_idempotent(
            raw in proptest::collection::vec((0u64..64, 0u64..64, 0usize..3), 0..40)
        ) {
            let mut points = vec![];
            for (image_offset, target_offset, target) in raw {
                insert_point(&mut points, point(image_offset, target_offset, target));
            }
            let once = pack(&points);
            prop_assert_eq!(pack(&once), once);
        }
    }
}
