//! Mapping between wire primitive names and value types.

use crate::error::ConversionError;
use std::fmt;
use std::str::FromStr;

/// Value type of a result item or bound variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    // Atomic types
    String,
    UntypedAtomic,
    AnyUri,
    QName,
    Boolean,
    Integer,
    Decimal,
    Double,
    Float,
    Date,
    DateTime,
    Time,
    GYear,
    GYearMonth,
    GMonth,
    GMonthDay,
    GDay,
    Duration,
    DayTimeDuration,
    YearMonthDuration,
    HexBinary,
    Base64Binary,
    GeoPoint,
    GeoBox,
    GeoCircle,
    GeoPolygon,
    JsonObject,
    JsonArray,

    // Node types
    Element,
    Text,
    Binary,
    Document,
    Attribute,
    Comment,
    ProcessingInstruction,
    ObjectNode,
    ArrayNode,
    NumberNode,
    BooleanNode,
    NullNode,
}

const PRIMITIVES: &[(ValueType, &str)] = &[
    (ValueType::String, "xs:string"),
    (ValueType::UntypedAtomic, "xs:untypedAtomic"),
    (ValueType::AnyUri, "xs:anyURI"),
    (ValueType::QName, "xs:QName"),
    (ValueType::Boolean, "xs:boolean"),
    (ValueType::Integer, "xs:integer"),
    (ValueType::Decimal, "xs:decimal"),
    (ValueType::Double, "xs:double"),
    (ValueType::Float, "xs:float"),
    (ValueType::Date, "xs:date"),
    (ValueType::DateTime, "xs:dateTime"),
    (ValueType::Time, "xs:time"),
    (ValueType::GYear, "xs:gYear"),
    (ValueType::GYearMonth, "xs:gYearMonth"),
    (ValueType::GMonth, "xs:gMonth"),
    (ValueType::GMonthDay, "xs:gMonthDay"),
    (ValueType::GDay, "xs:gDay"),
    (ValueType::Duration, "xs:duration"),
    (ValueType::DayTimeDuration, "xs:dayTimeDuration"),
    (ValueType::YearMonthDuration, "xs:yearMonthDuration"),
    (ValueType::HexBinary, "xs:hexBinary"),
    (ValueType::Base64Binary, "xs:base64Binary"),
    (ValueType::GeoPoint, "cts:point"),
    (ValueType::GeoBox, "cts:box"),
    (ValueType::GeoCircle, "cts:circle"),
    (ValueType::GeoPolygon, "cts:polygon"),
    (ValueType::JsonObject, "json:object"),
    (ValueType::JsonArray, "json:array"),
    (ValueType::Element, "element()"),
    (ValueType::Text, "text()"),
    (ValueType::Binary, "binary()"),
    (ValueType::Document, "document-node()"),
    (ValueType::Attribute, "attribute()"),
    (ValueType::Comment, "comment()"),
    (ValueType::ProcessingInstruction, "processing-instruction()"),
    (ValueType::ObjectNode, "object-node()"),
    (ValueType::ArrayNode, "array-node()"),
    (ValueType::NumberNode, "number-node()"),
    (ValueType::BooleanNode, "boolean-node()"),
    (ValueType::NullNode, "null-node()"),
];

/// Derived XML Schema types, reported under the family they restrict.
const DERIVED: &[(ValueType, &str)] = &[
    (ValueType::Integer, "xs:long"),
    (ValueType::Integer, "xs:int"),
    (ValueType::Integer, "xs:short"),
    (ValueType::Integer, "xs:byte"),
    (ValueType::Integer, "xs:unsignedLong"),
    (ValueType::Integer, "xs:unsignedInt"),
    (ValueType::Integer, "xs:unsignedShort"),
    (ValueType::Integer, "xs:unsignedByte"),
    (ValueType::Integer, "xs:nonNegativeInteger"),
    (ValueType::Integer, "xs:positiveInteger"),
    (ValueType::Integer, "xs:nonPositiveInteger"),
    (ValueType::Integer, "xs:negativeInteger"),
    (ValueType::String, "xs:normalizedString"),
    (ValueType::String, "xs:token"),
    (ValueType::String, "xs:language"),
    (ValueType::String, "xs:NMTOKEN"),
    (ValueType::String, "xs:Name"),
    (ValueType::String, "xs:NCName"),
    (ValueType::String, "xs:ID"),
    (ValueType::String, "xs:IDREF"),
    (ValueType::String, "xs:ENTITY"),
    (ValueType::DateTime, "xs:dateTimeStamp"),
];

impl ValueType {
    /// Look up a wire primitive name.
    ///
    /// Derived schema types resolve to their base family.
    ///
    /// # Errors
    /// Returns `ConversionError::UnsupportedType` for unknown names.
    pub fn from_primitive(name: &str) -> Result<Self, ConversionError> {
        let name = name.trim();
        PRIMITIVES
            .iter()
            .chain(DERIVED)
            .find(|(_, primitive)| *primitive == name)
            .map(|(vt, _)| *vt)
            .ok_or_else(|| ConversionError::UnsupportedType {
                type_name: name.to_string(),
            })
    }

    /// The wire primitive name.
    pub fn primitive(&self) -> &'static str {
        PRIMITIVES
            .iter()
            .find(|(vt, _)| vt == self)
            .map(|(_, primitive)| *primitive)
            .unwrap_or("xs:untypedAtomic")
    }

    /// Whether values of this type are nodes rather than atomic values.
    pub fn is_node(&self) -> bool {
        matches!(
            self,
            ValueType::Element
                | ValueType::Text
                | ValueType::Binary
                | ValueType::Document
                | ValueType::Attribute
                | ValueType::Comment
                | ValueType::ProcessingInstruction
                | ValueType::ObjectNode
                | ValueType::ArrayNode
                | ValueType::NumberNode
                | ValueType::BooleanNode
                | ValueType::NullNode
        )
    }

    /// Whether packed encodings delimit this type by code-point count.
    ///
    /// Binary nodes are packed as a base64 line and are not string-like.
    pub fn is_string_like(&self) -> bool {
        match self {
            ValueType::String | ValueType::UntypedAtomic | ValueType::AnyUri => true,
            ValueType::Binary => false,
            other => other.is_node(),
        }
    }

    /// Whether this is a numeric atomic type.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueType::Integer | ValueType::Decimal | ValueType::Double | ValueType::Float
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.primitive())
    }
}

impl FromStr for ValueType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_primitive(s)
    }
}
