//! Logical data types, column/table metadata and the small enums the engine
//! reports about tables and columns.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical data type of a column as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    Int32,
    Int64,
    Datetime,
    #[serde(rename = "float")]
    Float32,
    #[serde(rename = "double")]
    Float64,
    Ipv4,
    Ipv6,
    String,
    Binary,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Datetime => "datetime",
            DataType::Float32 => "float",
            DataType::Float64 => "double",
            DataType::Ipv4 => "ipv4",
            DataType::Ipv6 => "ipv6",
            DataType::String => "string",
            DataType::Binary => "binary",
        }
    }

    pub fn parse(name: &str) -> Option<DataType> {
        let ret = match name.to_ascii_lowercase().as_str() {
            "int16" => DataType::Int16,
            "int32" => DataType::Int32,
            "int64" => DataType::Int64,
            "datetime" => DataType::Datetime,
            "float" => DataType::Float32,
            "double" => DataType::Float64,
            "ipv4" => DataType::Ipv4,
            "ipv6" => DataType::Ipv6,
            "string" => DataType::String,
            "binary" => DataType::Binary,
            _ => return None,
        };
        Some(ret)
    }

    /// The dictionary column type a value of this logical type is stored as.
    pub fn column_type(&self) -> ColumnType {
        match self {
            DataType::Int16 => ColumnType::Short,
            DataType::Int32 => ColumnType::Integer,
            DataType::Int64 => ColumnType::Long,
            DataType::Datetime => ColumnType::Datetime,
            DataType::Float32 => ColumnType::Float,
            DataType::Float64 => ColumnType::Double,
            DataType::Ipv4 => ColumnType::Ipv4,
            DataType::Ipv6 => ColumnType::Ipv6,
            DataType::String => ColumnType::Varchar,
            DataType::Binary => ColumnType::Binary,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column type codes as stored in the `M$SYS_COLUMNS` dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Short,
    UShort,
    Integer,
    UInteger,
    Long,
    ULong,
    Float,
    Double,
    Varchar,
    Text,
    Clob,
    Blob,
    Binary,
    Datetime,
    Ipv4,
    Ipv6,
    Json,
}

impl ColumnType {
    pub fn code(&self) -> i32 {
        match self {
            ColumnType::Short => 4,
            ColumnType::UShort => 104,
            ColumnType::Integer => 8,
            ColumnType::UInteger => 108,
            ColumnType::Long => 12,
            ColumnType::ULong => 112,
            ColumnType::Float => 16,
            ColumnType::Double => 20,
            ColumnType::Varchar => 5,
            ColumnType::Text => 49,
            ColumnType::Clob => 53,
            ColumnType::Blob => 57,
            ColumnType::Binary => 97,
            ColumnType::Datetime => 6,
            ColumnType::Ipv4 => 32,
            ColumnType::Ipv6 => 36,
            ColumnType::Json => 61,
        }
    }

    pub fn from_code(code: i32) -> Option<ColumnType> {
        let ret = match code {
            4 => ColumnType::Short,
            104 => ColumnType::UShort,
            8 => ColumnType::Integer,
            108 => ColumnType::UInteger,
            12 => ColumnType::Long,
            112 => ColumnType::ULong,
            16 => ColumnType::Float,
            20 => ColumnType::Double,
            5 => ColumnType::Varchar,
            49 => ColumnType::Text,
            53 => ColumnType::Clob,
            57 => ColumnType::Blob,
            97 => ColumnType::Binary,
            6 => ColumnType::Datetime,
            32 => ColumnType::Ipv4,
            36 => ColumnType::Ipv6,
            61 => ColumnType::Json,
            _ => return None,
        };
        Some(ret)
    }

    /// Parse a DDL type keyword (`varchar`, `double`, ...).
    pub fn parse(name: &str) -> Option<ColumnType> {
        let ret = match name.to_ascii_lowercase().as_str() {
            "short" | "int16" => ColumnType::Short,
            "ushort" => ColumnType::UShort,
            "integer" | "int" | "int32" => ColumnType::Integer,
            "uinteger" => ColumnType::UInteger,
            "long" | "int64" | "bigint" => ColumnType::Long,
            "ulong" => ColumnType::ULong,
            "float" => ColumnType::Float,
            "double" => ColumnType::Double,
            "varchar" | "string" => ColumnType::Varchar,
            "text" => ColumnType::Text,
            "clob" => ColumnType::Clob,
            "blob" => ColumnType::Blob,
            "binary" => ColumnType::Binary,
            "datetime" => ColumnType::Datetime,
            "ipv4" => ColumnType::Ipv4,
            "ipv6" => ColumnType::Ipv6,
            "json" => ColumnType::Json,
            _ => return None,
        };
        Some(ret)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Short => "short",
            ColumnType::UShort => "ushort",
            ColumnType::Integer => "integer",
            ColumnType::UInteger => "uinteger",
            ColumnType::Long => "long",
            ColumnType::ULong => "ulong",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::Varchar => "varchar",
            ColumnType::Text => "text",
            ColumnType::Clob => "clob",
            ColumnType::Blob => "blob",
            ColumnType::Binary => "binary",
            ColumnType::Datetime => "datetime",
            ColumnType::Ipv4 => "ipv4",
            ColumnType::Ipv6 => "ipv6",
            ColumnType::Json => "json",
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ColumnType::Short | ColumnType::UShort => DataType::Int16,
            ColumnType::Integer | ColumnType::UInteger => DataType::Int32,
            ColumnType::Long | ColumnType::ULong => DataType::Int64,
            ColumnType::Float => DataType::Float32,
            ColumnType::Double => DataType::Float64,
            ColumnType::Varchar | ColumnType::Text | ColumnType::Json => DataType::String,
            ColumnType::Clob | ColumnType::Blob | ColumnType::Binary => DataType::Binary,
            ColumnType::Datetime => DataType::Datetime,
            ColumnType::Ipv4 => DataType::Ipv4,
            ColumnType::Ipv6 => DataType::Ipv6,
        }
    }

    /// Display width used by the shell when the column has no declared length.
    pub fn width(&self) -> Option<usize> {
        match self {
            ColumnType::Short => Some(6),
            ColumnType::UShort => Some(5),
            ColumnType::Integer => Some(11),
            ColumnType::UInteger => Some(10),
            ColumnType::Long | ColumnType::ULong => Some(20),
            ColumnType::Float | ColumnType::Double => Some(17),
            ColumnType::Ipv4 => Some(15),
            ColumnType::Ipv6 => Some(45),
            ColumnType::Datetime => Some(31),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column flag bits carried by tag table columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnFlag(pub i32);

impl ColumnFlag {
    pub const NONE: ColumnFlag = ColumnFlag(0);
    pub const TAG_NAME: ColumnFlag = ColumnFlag(0x0800_0000);
    pub const BASETIME: ColumnFlag = ColumnFlag(0x0100_0000);
    pub const SUMMARIZED: ColumnFlag = ColumnFlag(0x0200_0000);
    pub const META_COLUMN: ColumnFlag = ColumnFlag(0x0400_0000);

    pub fn contains(&self, other: ColumnFlag) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn union(self, other: ColumnFlag) -> ColumnFlag {
        ColumnFlag(self.0 | other.0)
    }

    pub fn describe(&self) -> &'static str {
        if self.contains(ColumnFlag::TAG_NAME) {
            "tag name"
        } else if self.contains(ColumnFlag::BASETIME) {
            "basetime"
        } else if self.contains(ColumnFlag::SUMMARIZED) {
            "summarized"
        } else if self.contains(ColumnFlag::META_COLUMN) {
            "meta"
        } else {
            ""
        }
    }
}

/// Table kinds. Only `Log` and `Tag` accept append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableType {
    Log,
    Fixed,
    Volatile,
    Lookup,
    KeyValue,
    Tag,
}

impl TableType {
    pub fn code(&self) -> i32 {
        match self {
            TableType::Log => 0,
            TableType::Fixed => 1,
            TableType::Volatile => 3,
            TableType::Lookup => 4,
            TableType::KeyValue => 5,
            TableType::Tag => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<TableType> {
        let ret = match code {
            0 => TableType::Log,
            1 => TableType::Fixed,
            3 => TableType::Volatile,
            4 => TableType::Lookup,
            5 => TableType::KeyValue,
            6 => TableType::Tag,
            _ => return None,
        };
        Some(ret)
    }

    pub fn accepts_append(&self) -> bool {
        matches!(self, TableType::Log | TableType::Tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableType::Log => "Log",
            TableType::Fixed => "Fixed",
            TableType::Volatile => "Volatile",
            TableType::Lookup => "Lookup",
            TableType::KeyValue => "KeyValue",
            TableType::Tag => "Tag",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableFlag {
    #[default]
    None,
    Data,
    Rollup,
    Meta,
    Stat,
}

impl TableFlag {
    pub fn code(&self) -> i32 {
        match self {
            TableFlag::None => 0,
            TableFlag::Data => 1,
            TableFlag::Rollup => 2,
            TableFlag::Meta => 4,
            TableFlag::Stat => 8,
        }
    }

    pub fn from_code(code: i64) -> TableFlag {
        match code {
            1 => TableFlag::Data,
            2 => TableFlag::Rollup,
            4 => TableFlag::Meta,
            8 => TableFlag::Stat,
            _ => TableFlag::None,
        }
    }
}

/// Human description of a table kind, e.g. `"Tag Table (data)"`.
pub fn table_type_description(typ: Option<TableType>, flag: TableFlag) -> String {
    let mut desc = match typ {
        Some(t) => format!("{} Table", t.as_str()),
        None => "undef".to_string(),
    };
    match flag {
        TableFlag::Data => desc.push_str(" (data)"),
        TableFlag::Rollup => desc.push_str(" (rollup)"),
        TableFlag::Meta => desc.push_str(" (meta)"),
        TableFlag::Stat => desc.push_str(" (stat)"),
        TableFlag::None => {}
    }
    desc
}

/// Result or table column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Dictionary id, 0 when the column came from a result set.
    #[serde(default)]
    pub id: u64,
    pub name: String,
    pub column_type: ColumnType,
    pub data_type: DataType,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub flag: ColumnFlag,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            id: 0,
            name: name.into(),
            column_type,
            data_type: column_type.data_type(),
            length: 0,
            flag: ColumnFlag::NONE,
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn with_flag(mut self, flag: ColumnFlag) -> Self {
        self.flag = self.flag.union(flag);
        self
    }

    pub fn is_tag_name(&self) -> bool {
        self.flag.contains(ColumnFlag::TAG_NAME)
    }

    pub fn is_basetime(&self) -> bool {
        self.flag.contains(ColumnFlag::BASETIME)
    }

    pub fn is_summarized(&self) -> bool {
        self.flag.contains(ColumnFlag::SUMMARIZED)
    }

    pub fn is_meta_column(&self) -> bool {
        self.flag.contains(ColumnFlag::META_COLUMN)
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('_')
    }

    pub fn width(&self) -> usize {
        self.column_type.width().unwrap_or(self.length)
    }
}

pub type Columns = Vec<Column>;

pub fn column_names(cols: &[Column]) -> Vec<String> {
    cols.iter().map(|c| c.name.clone()).collect()
}

pub fn column_data_types(cols: &[Column]) -> Vec<DataType> {
    cols.iter().map(|c| c.data_type).collect()
}
