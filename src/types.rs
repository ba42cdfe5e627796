use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// DICOM tags used by the QIDO-RS metadata shape, as 8-digit group/element strings.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.html>
pub mod tags {
	pub const SPECIFIC_CHARACTER_SET: &str = "00080005";
	pub const STUDY_DATE: &str = "00080020";
	pub const STUDY_TIME: &str = "00080030";
	pub const ACCESSION_NUMBER: &str = "00080050";
	pub const MODALITIES_IN_STUDY: &str = "00080061";
	pub const MODALITY: &str = "00080060";
	pub const REFERRING_PHYSICIAN_NAME: &str = "00080090";
	pub const PATIENT_NAME: &str = "00100010";
	pub const PATIENT_ID: &str = "00100020";
	pub const STUDY_UID: &str = "0020000D";
	pub const SERIES_UID: &str = "0020000E";
	pub const NUMBER_OF_SERIES: &str = "00201206";
	pub const NUMBER_OF_INSTANCES_IN_STUDY: &str = "00201208";
	pub const NUMBER_OF_INSTANCES_IN_SERIES: &str = "00201209";
	pub const STUDY_DESCRIPTION: &str = "00081030";
	pub const SOP_INSTANCE_UID: &str = "00080018";
	pub const INSTANCE_NUMBER: &str = "00200013";
	pub const SERIES_NUMBER: &str = "00200011";
	pub const SERIES_DESCRIPTION: &str = "0008103E";
	pub const SOP_CLASS_UID: &str = "00080016";
}

/// One QIDO-RS result dataset keyed by DICOM tag.
///
/// The tag-keyed JSON shape is defined by the QIDO-RS standard and must survive
/// the gateway byte-for-byte, so records carry the raw `serde_json` map instead
/// of a typed projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QidoRecord(pub serde_json::Map<String, serde_json::Value>);

impl QidoRecord {
	/// All values for a tag, in attribute order.
	pub fn values(&self, tag: &str) -> &[serde_json::Value] {
		self.0
			.get(tag)
			.and_then(|attr| attr.get("Value"))
			.and_then(serde_json::Value::as_array)
			.map_or(&[], Vec::as_slice)
	}

	/// The first value of a tag as a string, if present.
	pub fn str_value(&self, tag: &str) -> Option<&str> {
		self.values(tag).first().and_then(serde_json::Value::as_str)
	}

	/// The first value of a tag as an unsigned integer, if present.
	pub fn uint_value(&self, tag: &str) -> Option<u64> {
		self.values(tag).first().and_then(serde_json::Value::as_u64)
	}

	/// The Alphabetic component of the first person-name value, if present.
	pub fn person_name(&self, tag: &str) -> Option<&str> {
		self.values(tag)
			.first()
			.and_then(|value| value.get("Alphabetic"))
			.and_then(serde_json::Value::as_str)
	}
}

/// A study record enriched with nested series and instance records,
/// assembled per requested [`DetailLevel`].
#[derive(Debug, Clone, PartialEq)]
pub struct StudyEnriched {
	pub study: QidoRecord,
	pub series: Vec<SeriesEnriched>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesEnriched {
	pub series: QidoRecord,
	pub instances: Option<Vec<QidoRecord>>,
}

/// How deep `enrich_studies` fans out additional queries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum DetailLevel {
	Study,
	#[default]
	Series,
	Instance,
}

impl Display for DetailLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Instance => write!(f, "INSTANCE"),
		}
	}
}

/// The query-restriction context of one inbound lookup.
///
/// Produced once from validated query parameters and carried unchanged into
/// every capability token minted from that lookup. A restriction is only ever
/// satisfied by an [`crate::auth::Authorizer`] bound to the same tenant and
/// patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRestrictions {
	pub tenant_key: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub by_patient_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub by_patient_identifier: Option<Identifier>,
}

/// FHIR Identifier, reduced to the fields the gateway reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<String>,
	pub value: String,
	#[serde(rename = "type", skip_serializing_if = "Option::is_none")]
	pub type_: Option<CodeableConcept>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeableConcept {
	#[serde(default)]
	pub coding: Vec<Coding>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<String>,
	pub code: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub display: Option<String>,
}

/// FHIR Patient, reduced to the fields the gateway reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patient {
	pub id: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub identifier: Vec<Identifier>,
}

impl Patient {
	/// Selects the medical record number: the first identifier whose type
	/// coding matches `type_code`, falling back to the first identifier.
	pub fn mrn(&self, type_code: &str) -> Option<&str> {
		self.identifier
			.iter()
			.find(|identifier| {
				identifier
					.type_
					.as_ref()
					.is_some_and(|t| t.coding.iter().any(|coding| coding.code == type_code))
			})
			.or_else(|| self.identifier.first())
			.map(|identifier| identifier.value.as_str())
	}
}

/// OAuth token introspection result, per RFC 7662 plus the SMART `patient`
/// launch-context claim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntrospectionResponse {
	pub active: bool,
	#[serde(default)]
	pub scope: String,
	#[serde(default)]
	pub patient: Option<String>,
	#[serde(default)]
	pub sub: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn record(value: serde_json::Value) -> QidoRecord {
		serde_json::from_value(value).unwrap()
	}

	#[test]
	fn qido_record_preserves_wire_shape() {
		let raw = json!({
			"0020000D": { "vr": "UI", "Value": ["1.2.3"] },
			"00080061": { "vr": "CS", "Value": ["CT", "SR"] },
		});
		let parsed = record(raw.clone());
		assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
		assert_eq!(parsed.str_value(tags::STUDY_UID), Some("1.2.3"));
		assert_eq!(parsed.values(tags::MODALITIES_IN_STUDY).len(), 2);
		assert_eq!(parsed.str_value(tags::PATIENT_ID), None);
	}

	#[test]
	fn person_name_reads_alphabetic_component() {
		let parsed = record(json!({
			"00100010": { "vr": "PN", "Value": [{ "Alphabetic": "Doe^Jane" }] },
		}));
		assert_eq!(parsed.person_name(tags::PATIENT_NAME), Some("Doe^Jane"));
	}

	#[test]
	fn mrn_prefers_typed_identifier() {
		let patient: Patient = serde_json::from_value(json!({
			"id": "pat-1",
			"identifier": [
				{ "system": "urn:x", "value": "other" },
				{
					"value": "mrn-42",
					"type": { "coding": [{ "code": "MR" }] }
				},
			]
		}))
		.unwrap();

		assert_eq!(patient.mrn("MR"), Some("mrn-42"));
		// No typed match falls back to the first identifier.
		assert_eq!(patient.mrn("DL"), Some("other"));
	}
}
