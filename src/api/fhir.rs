//! FHIR-facing lookup: `ImagingStudy` search results as a Bundle whose
//! contained retrieval endpoints carry freshly minted capability tokens.

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::Query;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{instrument, warn};

use crate::api::Tenant;
use crate::error::{AuthorizationError, GatewayError};
use crate::provider::Activity;
use crate::token::CapabilityTokens;
use crate::types::{tags, DetailLevel, Identifier, QueryRestrictions, StudyEnriched};
use crate::AppState;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/", get(welcome))
		.route("/metadata", get(metadata))
		.route("/ImagingStudy", get(imaging_study))
}

async fn welcome() -> impl IntoResponse {
	Json(json!({
		"Welcome": "To the SMART Imaging Access Server",
		"SeeAlso": ["./metadata", "./ImagingStudy?patient={}"],
	}))
}

async fn metadata() -> impl IntoResponse {
	Json(json!({
		"resourceType": "CapabilityStatement",
		"status": "active",
		"date": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
		"kind": "instance",
		"fhirVersion": "4.0.1",
		"format": ["json", "application/fhir+json"],
		"rest": [{
			"mode": "server",
			"resource": [{
				"type": "ImagingStudy",
				"interaction": [{ "code": "search-type" }],
				"searchInclude": ["*", "ImagingStudy:endpoint"],
				"searchParam": [{
					"name": "patient",
					"definition": "http://hl7.org/fhir/SearchParameter/clinical-patient",
					"type": "reference",
				}],
			}],
		}],
	}))
}

#[derive(Debug, Default, Deserialize)]
pub struct LookupParameters {
	#[serde(default)]
	patient: Option<String>,
	#[serde(default, rename = "patient.identifier")]
	patient_identifier: Option<String>,
	#[serde(default, rename = "subject.identifier")]
	subject_identifier: Option<String>,
}

#[instrument(skip_all, fields(tenant = %tenant.key))]
async fn imaging_study(
	tenant: Tenant,
	State(state): State<AppState>,
	Query(parameters): Query<LookupParameters>,
) -> Result<Response, GatewayError> {
	let restrictions = query_restrictions(&tenant.key, &parameters);
	tenant.authorizer.ensure_query_allowed(&restrictions)?;

	if let Some(seconds_remaining) = tenant.provider.delayed(Activity::Lookup) {
		return Err(GatewayError::NotYetAvailable { seconds_remaining });
	}

	let (query, patient_reference) = prepare_query(&tenant, &restrictions)?;
	let studies = tenant.provider.evaluate_qido(&query).await?;
	let studies = tenant
		.provider
		.enrich_studies(studies, DetailLevel::Series)
		.await?;

	let bundle = build_bundle(
		&studies,
		patient_reference.as_deref(),
		&tenant.wado_base,
		&state.tokens,
		&restrictions,
	)?;

	Ok((
		[(header::CONTENT_TYPE, "application/fhir+json")],
		Json(bundle),
	)
		.into_response())
}

/// The restriction context of this lookup, minted into every capability token
/// derived from it.
fn query_restrictions(tenant_key: &str, parameters: &LookupParameters) -> QueryRestrictions {
	let by_patient_id = parameters.patient.as_deref().map(|patient| {
		patient
			.strip_prefix("Patient/")
			.unwrap_or(patient)
			.to_owned()
	});
	let by_patient_identifier = parameters
		.patient_identifier
		.as_deref()
		.or(parameters.subject_identifier.as_deref())
		.map(parse_identifier);

	QueryRestrictions {
		tenant_key: tenant_key.to_owned(),
		by_patient_id,
		by_patient_identifier,
	}
}

/// `system|value` search-token syntax; a bare value has no system.
fn parse_identifier(raw: &str) -> Identifier {
	let (system, value) = match raw.rsplit_once('|') {
		Some((system, value)) if !system.is_empty() => (Some(system.to_owned()), value),
		Some((_, value)) => (None, value),
		None => (None, raw),
	};
	Identifier {
		system,
		value: value.to_owned(),
		type_: None,
	}
}

/// Translates the restriction context into backend QIDO parameters and the
/// FHIR reference embedded into the result resources.
fn prepare_query(
	tenant: &Tenant,
	restrictions: &QueryRestrictions,
) -> Result<(BTreeMap<String, String>, Option<String>), GatewayError> {
	use crate::config::LookupMode;

	let mut query = BTreeMap::new();
	let mut patient_reference = None;

	if tenant.config.dicom.lookup == LookupMode::StudiesByMrn {
		if let Some(patient_id) = &restrictions.by_patient_id {
			let patient = tenant.authorizer.resolve_patient(patient_id)?;
			let mrn = patient
				.mrn(&tenant.config.dicom.mrn_type_code)
				.ok_or(AuthorizationError::NoPatient)?;
			query.insert(String::from("PatientID"), mrn.to_owned());

			let base = tenant
				.config
				.authorization
				.fhir_base_url()
				.map(|url| url.as_str().trim_end_matches('/').to_owned());
			patient_reference = Some(match base {
				Some(base) => format!("{base}/Patient/{}", patient.id),
				None => format!("Patient/{}", patient.id),
			});
		} else if let Some(identifier) = &restrictions.by_patient_identifier {
			query.insert(String::from("PatientID"), identifier.value.clone());
		}
	}

	Ok((query, patient_reference))
}

/// Wraps the enriched studies into a searchset Bundle, minting one capability
/// token per study for its contained retrieval endpoint.
fn build_bundle(
	studies: &[StudyEnriched],
	patient_reference: Option<&str>,
	wado_base: &str,
	tokens: &CapabilityTokens,
	restrictions: &QueryRestrictions,
) -> Result<Value, GatewayError> {
	let mut entries = Vec::with_capacity(studies.len());
	for enriched in studies {
		let Some(uid) = enriched.study.str_value(tags::STUDY_UID) else {
			warn!("skipping study without StudyInstanceUID");
			continue;
		};
		let token = tokens.issue(uid, restrictions)?;
		let address = format!("{wado_base}/{token}");
		entries.push(json!({
			"resource": format_resource(enriched, uid, patient_reference, &address),
		}));
	}

	Ok(json!({
		"resourceType": "Bundle",
		"type": "searchset",
		"entry": entries,
	}))
}

fn format_resource(
	enriched: &StudyEnriched,
	uid: &str,
	patient_reference: Option<&str>,
	endpoint_address: &str,
) -> Value {
	let study = &enriched.study;
	let started = format_date(
		study.str_value(tags::STUDY_DATE),
		study.str_value(tags::STUDY_TIME),
	);
	let modality: Vec<Value> = study
		.values(tags::MODALITIES_IN_STUDY)
		.iter()
		.filter_map(Value::as_str)
		.map(|code| {
			json!({
				"system": "http://dicom.nema.org/resources/ontology/DCM",
				"code": code,
			})
		})
		.collect();
	let description = study
		.str_value(tags::STUDY_DESCRIPTION)
		.map(str::to_owned)
		.or_else(|| {
			let joined = study
				.values(tags::MODALITIES_IN_STUDY)
				.iter()
				.filter_map(Value::as_str)
				.collect::<Vec<_>>()
				.join(", ");
			(!joined.is_empty()).then_some(joined)
		});

	let series: Vec<Value> = enriched
		.series
		.iter()
		.map(|series_enriched| {
			let series = &series_enriched.series;
			let instance: Option<Vec<Value>> = series_enriched.instances.as_ref().map(|instances| {
				instances
					.iter()
					.map(|instance| {
						json!({
							"uid": instance.str_value(tags::SOP_INSTANCE_UID),
							"number": instance.uint_value(tags::INSTANCE_NUMBER),
							"sopClass": instance.str_value(tags::SOP_CLASS_UID).map(|sop| json!({
								"system": "urn:ietf:rfc:3986",
								"code": format!("urn:oid:{sop}"),
							})),
						})
					})
					.collect()
			});
			json!({
				"uid": series.str_value(tags::SERIES_UID),
				"number": series.uint_value(tags::SERIES_NUMBER),
				"numberOfInstances": series.uint_value(tags::NUMBER_OF_INSTANCES_IN_SERIES),
				"title": series.str_value(tags::SERIES_DESCRIPTION),
				"modality": series.str_value(tags::MODALITY).map(|code| json!({
					"system": "http://dicom.nema.org/resources/ontology/DCM",
					"code": code,
				})),
				"instance": instance,
			})
		})
		.collect();

	let mut resource = json!({
		"resourceType": "ImagingStudy",
		"status": "available",
		"id": uid,
		"identifier": [{ "system": "urn:dicom:uid", "value": format!("urn:oid:{uid}") }],
		"subject": {
			"display": format_name(study.person_name(tags::PATIENT_NAME)),
			"reference": patient_reference,
		},
		"started": started,
		"referrer": {
			"display": format_name(study.person_name(tags::REFERRING_PHYSICIAN_NAME)),
		},
		"description": description,
		"numberOfSeries": study.uint_value(tags::NUMBER_OF_SERIES),
		"numberOfInstances": study.uint_value(tags::NUMBER_OF_INSTANCES_IN_STUDY),
		"modality": modality,
		"contained": [{
			"resourceType": "Endpoint",
			"id": "e",
			"address": endpoint_address,
			"connectionType": {
				"system": "http://terminology.hl7.org/CodeSystem/endpoint-connection-type",
				"code": "dicom-wado-rs",
			},
		}],
		"endpoint": { "reference": "#e" },
		"series": series,
	});
	prune_nulls(&mut resource);
	resource
}

/// `PN` components arrive family-first; display order is given names first.
fn format_name(name: Option<&str>) -> Option<String> {
	let parts: Vec<&str> = name?
		.split('^')
		.map(str::trim)
		.filter(|part| !part.is_empty())
		.collect();
	let (family, given) = parts.split_first()?;
	if given.is_empty() {
		Some((*family).to_owned())
	} else {
		Some(format!("{} {family}", given.join(" ")))
	}
}

/// DICOM `DA`/`TM` to FHIR dateTime (or date when no time is present).
fn format_date(date: Option<&str>, time: Option<&str>) -> Option<String> {
	let date = date?;
	if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	let formatted = format!("{}-{}-{}", &date[0..4], &date[4..6], &date[6..8]);

	match time.and_then(split_time) {
		Some((hms, fraction)) => Some(format!(
			"{formatted}T{}:{}:{}{fraction}Z",
			&hms[0..2],
			&hms[2..4],
			&hms[4..6]
		)),
		None => Some(formatted),
	}
}

/// Splits a TM value into its HHMMSS prefix and a valid fractional suffix.
/// Anything malformed drops the time portion instead of the whole value.
fn split_time(time: &str) -> Option<(&str, &str)> {
	let (hms, rest) = time.split_at_checked(6)?;
	if !hms.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	let fraction = match rest.strip_prefix('.') {
		Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => rest,
		_ => "",
	};
	Some((hms, fraction))
}

/// Drops null members so optional DICOM attributes vanish from the resource
/// instead of surfacing as JSON nulls.
fn prune_nulls(value: &mut Value) {
	match value {
		Value::Object(map) => {
			map.retain(|_, member| !member.is_null());
			map.values_mut().for_each(prune_nulls);
		}
		Value::Array(items) => items.iter_mut().for_each(prune_nulls),
		_ => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{QidoRecord, SeriesEnriched};
	use serde_json::json;

	fn study(value: Value) -> QidoRecord {
		serde_json::from_value(value).unwrap()
	}

	#[test]
	fn name_reorders_family_component_last() {
		assert_eq!(format_name(Some("Doe^Jane")), Some(String::from("Jane Doe")));
		assert_eq!(
			format_name(Some("Doe^Jane^M")),
			Some(String::from("Jane M Doe"))
		);
		assert_eq!(format_name(Some("Doe")), Some(String::from("Doe")));
		assert_eq!(format_name(Some("^^")), None);
		assert_eq!(format_name(None), None);
	}

	#[test]
	fn date_and_time_format_as_fhir_datetime() {
		assert_eq!(
			format_date(Some("20230102"), None),
			Some(String::from("2023-01-02"))
		);
		assert_eq!(
			format_date(Some("20230102"), Some("101530")),
			Some(String::from("2023-01-02T10:15:30Z"))
		);
		assert_eq!(
			format_date(Some("20230102"), Some("101530.25")),
			Some(String::from("2023-01-02T10:15:30.25Z"))
		);
		assert_eq!(format_date(Some("2023"), None), None);
		assert_eq!(format_date(None, Some("101530")), None);
	}

	#[test]
	fn malformed_time_values_keep_the_date() {
		// Non-ASCII TM payloads must not split mid character.
		assert_eq!(
			format_date(Some("20230102"), Some("12345ö")),
			Some(String::from("2023-01-02"))
		);
		assert_eq!(
			format_date(Some("20230102"), Some("123456ö")),
			Some(String::from("2023-01-02T12:34:56Z"))
		);
		assert_eq!(
			format_date(Some("20230102"), Some("101530.")),
			Some(String::from("2023-01-02T10:15:30Z"))
		);
		assert_eq!(
			format_date(Some("20230102"), Some("1015")),
			Some(String::from("2023-01-02"))
		);
	}

	#[test]
	fn identifier_token_splits_on_last_pipe() {
		let identifier = parse_identifier("urn:mrn|1234");
		assert_eq!(identifier.system.as_deref(), Some("urn:mrn"));
		assert_eq!(identifier.value, "1234");

		let bare = parse_identifier("1234");
		assert_eq!(bare.system, None);
		assert_eq!(bare.value, "1234");
	}

	#[test]
	fn restrictions_strip_patient_reference_prefix() {
		let parameters = LookupParameters {
			patient: Some(String::from("Patient/pat-1")),
			..LookupParameters::default()
		};
		let restrictions = query_restrictions("tenant-a", &parameters);
		assert_eq!(restrictions.by_patient_id.as_deref(), Some("pat-1"));
		assert_eq!(restrictions.tenant_key, "tenant-a");
	}

	#[test]
	fn empty_search_yields_empty_bundle() {
		let tokens = CapabilityTokens::new(None);
		let restrictions = query_restrictions("tenant-a", &LookupParameters::default());

		let bundle = build_bundle(&[], None, "http://gw/tenant-a/wado", &tokens, &restrictions)
			.unwrap();
		assert_eq!(bundle["resourceType"], "Bundle");
		assert_eq!(bundle["entry"].as_array().unwrap().len(), 0);
	}

	#[test]
	fn bundle_embeds_minted_token_in_contained_endpoint() {
		let tokens = CapabilityTokens::new(None);
		let restrictions = query_restrictions("tenant-a", &LookupParameters::default());
		let enriched = StudyEnriched {
			study: study(json!({
				"0020000D": { "vr": "UI", "Value": ["1.2.3"] },
				"00080020": { "vr": "DA", "Value": ["20230102"] },
				"00080030": { "vr": "TM", "Value": ["101530"] },
				"00080061": { "vr": "CS", "Value": ["CT"] },
				"00100010": { "vr": "PN", "Value": [{ "Alphabetic": "Doe^Jane" }] },
			})),
			series: vec![SeriesEnriched {
				series: study(json!({
					"0020000E": { "vr": "UI", "Value": ["1.2.3.4"] },
					"00080060": { "vr": "CS", "Value": ["CT"] },
				})),
				instances: None,
			}],
		};

		let bundle = build_bundle(
			&[enriched],
			Some("https://ehr.example.org/fhir/Patient/pat-1"),
			"http://gw/tenant-a/wado",
			&tokens,
			&restrictions,
		)
		.unwrap();

		let resource = &bundle["entry"][0]["resource"];
		assert_eq!(resource["id"], "1.2.3");
		assert_eq!(resource["started"], "2023-01-02T10:15:30Z");
		assert_eq!(resource["subject"]["display"], "Jane Doe");
		assert_eq!(resource["modality"][0]["code"], "CT");
		assert_eq!(resource["series"][0]["uid"], "1.2.3.4");
		assert_eq!(resource["endpoint"]["reference"], "#e");

		let address = resource["contained"][0]["address"].as_str().unwrap();
		let token = address
			.strip_prefix("http://gw/tenant-a/wado/")
			.unwrap();
		assert_eq!(tokens.redeem(token, "1.2.3").unwrap(), restrictions);

		// No StudyDescription, so the modality list stands in for it.
		assert_eq!(resource["description"], "CT");

		// Absent DICOM attributes are omitted, not null.
		assert!(resource.get("numberOfSeries").is_none());
		assert!(resource["series"][0].get("instance").is_none());
	}
}
