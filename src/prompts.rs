//! Fixed prompts for the extraction and synthesis stages.

use crate::schema::ExtractedQuote;

/// Sent with each inlined quote document.
pub const EXTRACTION_PROMPT: &str = r#"You are an expert insurance analyst. Analyze this insurance policy document or quote and extract the following information in a structured JSON format.

Return ONLY valid JSON with this exact structure:
{
  "insurerName": "string - name of the insurance company",
  "premium": {
    "monthly": number or null,
    "annual": number or null,
    "currency": "string - e.g. ZAR, USD"
  },
  "coverType": "string - e.g. Comprehensive, Third Party Only, Third Party Fire & Theft",
  "basisOfIndemnity": "string - e.g. Retail Value, Market Value, Agreed Value",
  "thirdPartyLiability": "string - e.g. R2,500,000",
  "passengerLiability": "string or null",
  "sasria": "Included or Excluded",
  "territorialLimits": "string",
  "legalCover": "string - Included/Excluded/Not specified",
  "personalAccident": "string - details or Excluded",
  "roadsideAssistance": "string - details or Excluded",
  "lossOfUse": "string - details or Not included",
  "creditShortfall": "string - details or Not included",
  "excess": {
    "type": "string - Fixed or Percentage-based or Mixed",
    "accident": "string - e.g. R15,000 or 10% min R15,000",
    "theft": "string",
    "thirdParty": "string",
    "windscreen": "string",
    "actsOfNature": "string or null",
    "otherExcesses": ["string - any additional excess conditions"],
    "notes": "string - any important excess notes"
  },
  "specialConditions": ["string - list of important conditions, warranties, requirements"],
  "inclusions": ["string - list of what is included"],
  "exclusions": ["string - list of what is excluded"],
  "insuredItem": "string - description of what is insured (e.g. 2016 Hyundai i10)",
  "policyNumber": "string or null",
  "additionalNotes": "string - any other relevant information"
}

If a field cannot be determined from the document, use null."#;

/// Prefix of the synthesis prompt. The client name and the extracted records
/// are appended by [`comparison_prompt`].
pub const COMPARISON_PROMPT: &str = r#"You are an expert insurance broker analyst. You have been provided with extracted data from multiple insurance quotes/policies for the same client.

Your task is to produce a comprehensive, professional comparison that:
1. Helps the client make an informed decision
2. Meets all compliance requirements for insurance advice
3. Clearly highlights key differentiators

Produce your output as valid JSON with this exact structure:
{
  "summary": "A brief 2-3 sentence summary of the comparison",
  "premiumComparison": {
    "items": [
      {
        "insurer": "string",
        "monthlyPremium": "string - formatted amount",
        "annualPremium": "string - formatted amount or N/A"
      }
    ],
    "difference": "string - plain language description of cost difference",
    "cheapest": "string - insurer name"
  },
  "coverComparison": {
    "features": [
      {
        "feature": "string - feature name",
        "values": { "insurerName": "string - value for this insurer" }
      }
    ]
  },
  "excessComparison": {
    "insurers": {
      "insurerName": {
        "type": "string",
        "details": ["string - excess detail lines"],
        "notes": "string"
      }
    },
    "exampleScenarios": [
      {
        "scenario": "string - description",
        "values": { "insurerName": "string - excess amount" }
      }
    ],
    "analysis": "string - professional analysis of excess structures"
  },
  "conditionsDifferences": {
    "insurers": {
      "insurerName": ["string - important condition points"]
    },
    "analysis": "string - professional analysis of conditions"
  },
  "recommendation": "string - detailed professional recommendation with reasoning. Include scenarios for different client priorities (cost vs risk). Be balanced and compliant.",
  "emailDraft": "string - a complete, professional email ready to send to the client. Use markdown formatting: **bold** for emphasis, markdown tables (| Header | Header |) for comparisons, bullet lists with - for details, and ### headings for sections. Include proper greeting (use Dear [Client Name]), the full comparison details, the recommendation, and a professional closing. This should be comprehensive enough to serve as the record of advice."
}

Here is the extracted data from the quotes:
"#;

/// Full synthesis prompt: fixed instructions, the client name, then the
/// extracted records as pretty-printed JSON in document order.
pub fn comparison_prompt(
    client_name: &str,
    quotes: &[ExtractedQuote],
) -> Result<String, serde_json::Error> {
    let records = serde_json::to_string_pretty(quotes)?;
    Ok(format!(
        "{}\n\nClient Name: {}\n\n{}",
        COMPARISON_PROMPT, client_name, records
    ))
}
