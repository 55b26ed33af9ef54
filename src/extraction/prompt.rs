//! Prompt text for document extraction.
//!
//! The model only transcribes. Eligibility, fabrication and duplicate
//! decisions are made in code after extraction.

pub fn build_extraction_system_prompt() -> String {
    r#"You read a single document received by a teacher recruitment inbox and transcribe the candidate it describes into JSON.

Respond with ONLY a JSON object of this shape, no prose:

{
  "candidates": [
    {
      "name": "full name exactly as written",
      "email": "address or null",
      "phone": "number or null",
      "qualification": "highest qualification as written, e.g. 'B.Ed (Foundation Phase)'",
      "qualification_type": "bachelors | honours | masters | doctorate | pgce | diploma | certificate | other | unknown",
      "has_degree": true,
      "institution": "institution that awarded the highest qualification, or null",
      "degree_country": "country of that institution, or null",
      "years_experience": 0,
      "teaching_phases": ["foundation", "intermediate", "senior", "fet"],
      "subjects": ["subjects the candidate can teach"],
      "has_teaching_registration": false,
      "has_tefl": false,
      "countries": ["countries of citizenship, residence or work history"],
      "current_location": "city/region as written, or null",
      "holistic_score": 0,
      "notes": "one short factual sentence, or null"
    }
  ]
}

Rules:
- If the document is not a CV/resume (cover letter only, invoice, form, newsletter, blank page), return {"candidates": []}.
- Describe at most one candidate: the person the document is about.
- Never invent values. Use null, false, 0 or [] for anything not stated.
- "has_degree" is true only for a completed university degree (bachelor's or higher). Diplomas and certificates are not degrees.
- "years_experience" is total years of teaching or tutoring work as a number.
- "has_teaching_registration" is true when the document states registration with a teaching council (e.g. SACE).
- "holistic_score" is 0-100 for overall completeness and clarity of the CV, not suitability."#
        .to_string()
}

/// User turn sent alongside the document block.
pub fn build_extraction_user_prompt(filename: &str) -> String {
    format!("Extract the candidate from the attached document \"{filename}\". JSON only.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_describes_shape() {
        let prompt = build_extraction_system_prompt();
        assert!(prompt.contains("\"candidates\""));
        assert!(prompt.contains("has_degree"));
        assert!(prompt.contains("{\"candidates\": []}"));
    }

    #[test]
    fn system_prompt_does_not_ask_for_eligibility() {
        let prompt = build_extraction_system_prompt().to_lowercase();
        assert!(!prompt.contains("eligible"));
        assert!(!prompt.contains("reject"));
    }

    #[test]
    fn user_prompt_names_file() {
        assert!(build_extraction_user_prompt("cv.pdf").contains("\"cv.pdf\""));
    }
}
