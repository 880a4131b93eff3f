//! Public header block of the LAS binary format.
//!
//! The header is a fixed 227-byte little-endian block. Every multi-byte
//! numeric field is little-endian; fixed-length ASCII fields are read
//! byte-by-byte at their declared width with no terminator assumptions.
use std::fmt;

use crate::error::{IndexError, IndexResult};
use crate::record::PointFormat;

/// Size of the public header block in bytes.
pub const HEADER_SIZE: usize = 227;

/// Required magic string at the start of every file.
pub const FILE_SIGNATURE: &[u8; 4] = b"LASF";

/// Parsed public header block. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct LasHeader {
    pub file_source_id: u16,
    pub global_encoding: u16,
    pub project_id_guid_1: u32,
    pub project_id_guid_2: u16,
    pub project_id_guid_3: u16,
    pub project_id_guid_4: String,
    pub version_major: u8,
    pub version_minor: u8,
    pub system_identifier: String,
    pub generating_software: String,
    pub file_creation_day_of_year: u16,
    pub file_creation_year: u16,
    pub header_size: u16,
    /// Byte offset from the start of the file to the first point record.
    pub offset_to_point_data: u32,
    pub number_of_vlrs: u32,
    /// Record format selector, already validated against the known set.
    pub point_format: PointFormat,
    /// Declared size of one point record. May exceed the format's nominal
    /// size when producers append extra bytes; used as the record stride.
    pub record_length: u16,
    /// Total number of point records in the file.
    pub record_count: u32,
    pub points_by_return: [u32; 5],
    pub scale: (f64, f64, f64),
    pub offset: (f64, f64, f64),
    pub max_x: f64,
    pub min_x: f64,
    pub max_y: f64,
    pub min_y: f64,
    pub max_z: f64,
    pub min_z: f64,
}

impl LasHeader {
    /// Parse the fixed-size header block. Pure: no side effects, no reads
    /// beyond the given slice.
    pub fn parse(block: &[u8]) -> IndexResult<Self> {
        if block.len() < HEADER_SIZE || &block[0..4] != FILE_SIGNATURE {
            return Err(IndexError::MalformedHeader);
        }

        let mut cursor = ByteCursor::new(&block[4..HEADER_SIZE]);

        let file_source_id = cursor.u16();
        let global_encoding = cursor.u16();
        let project_id_guid_1 = cursor.u32();
        let project_id_guid_2 = cursor.u16();
        let project_id_guid_3 = cursor.u16();
        let project_id_guid_4 = cursor.ascii(8);
        let version_major = cursor.u8();
        let version_minor = cursor.u8();
        let system_identifier = cursor.ascii(32);
        let generating_software = cursor.ascii(32);
        let file_creation_day_of_year = cursor.u16();
        let file_creation_year = cursor.u16();
        let header_size = cursor.u16();
        let offset_to_point_data = cursor.u32();
        let number_of_vlrs = cursor.u32();
        let format_id = cursor.u8();
        let record_length = cursor.u16();
        let record_count = cursor.u32();
        let points_by_return = [
            cursor.u32(),
            cursor.u32(),
            cursor.u32(),
            cursor.u32(),
            cursor.u32(),
        ];
        let scale = (cursor.f64(), cursor.f64(), cursor.f64());
        let offset = (cursor.f64(), cursor.f64(), cursor.f64());
        let max_x = cursor.f64();
        let min_x = cursor.f64();
        let max_y = cursor.f64();
        let min_y = cursor.f64();
        let max_z = cursor.f64();
        let min_z = cursor.f64();

        let point_format = PointFormat::from_id(format_id)?;

        Ok(Self {
            file_source_id,
            global_encoding,
            project_id_guid_1,
            project_id_guid_2,
            project_id_guid_3,
            project_id_guid_4,
            version_major,
            version_minor,
            system_identifier,
            generating_software,
            file_creation_day_of_year,
            file_creation_year,
            header_size,
            offset_to_point_data,
            number_of_vlrs,
            point_format,
            record_length,
            record_count,
            points_by_return,
            scale,
            offset,
            max_x,
            min_x,
            max_y,
            min_y,
            max_z,
            min_z,
        })
    }

    /// The stride between consecutive point records. Falls back to the
    /// format's nominal size when the declared length is smaller.
    pub fn record_stride(&self) -> u64 {
        (self.record_length as u64).max(self.point_format.record_size() as u64)
    }
}

impl fmt::Display for LasHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "file source ID:             {}", self.file_source_id)?;
        writeln!(f, "global encoding:            {}", self.global_encoding)?;
        writeln!(
            f,
            "project ID GUID data 1-4:   {}-{}-{}-{}",
            self.project_id_guid_1,
            self.project_id_guid_2,
            self.project_id_guid_3,
            self.project_id_guid_4
        )?;
        writeln!(
            f,
            "version major.minor:        {}.{}",
            self.version_major, self.version_minor
        )?;
        writeln!(f, "system identifier:          {}", self.system_identifier)?;
        writeln!(f, "generating software:        {}", self.generating_software)?;
        writeln!(
            f,
            "file creation day/year:     {}/{}",
            self.file_creation_day_of_year, self.file_creation_year
        )?;
        writeln!(f, "header size:                {}", self.header_size)?;
        writeln!(f, "offset to point data:       {}", self.offset_to_point_data)?;
        writeln!(f, "number var. length records: {}", self.number_of_vlrs)?;
        writeln!(f, "point data format:          {}", self.point_format.id())?;
        writeln!(f, "point data record length:   {}", self.record_length)?;
        writeln!(f, "number of point records:    {}", self.record_count)?;
        writeln!(
            f,
            "scale factor x y z:         {} {} {}",
            self.scale.0, self.scale.1, self.scale.2
        )?;
        writeln!(
            f,
            "offset x y z:               {} {} {}",
            self.offset.0, self.offset.1, self.offset.2
        )?;
        writeln!(
            f,
            "min x y z:                  {} {} {}",
            self.min_x, self.min_y, self.min_z
        )?;
        writeln!(
            f,
            "max x y z:                  {} {} {}",
            self.max_x, self.max_y, self.max_z
        )
    }
}

/// Sequential little-endian reader over a byte slice. The slice length is
/// validated once up front, so field reads index without further checks.
struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take::<2>())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take::<4>())
    }

    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take::<8>())
    }

    /// Read a fixed-width ASCII field byte-by-byte, dropping trailing NULs.
    fn ascii(&mut self, width: usize) -> String {
        let bytes = &self.buf[self.pos..self.pos + width];
        self.pos += width;
        let mut result = String::with_capacity(width);
        for &b in bytes {
            result.push(b as char);
        }
        result.trim_end_matches('\0').to_string()
    }
}
