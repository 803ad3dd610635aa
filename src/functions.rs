//! Server-side helper functions installed at the start of a run.

/// Clones a table's structure, indexes, defaults and constraints included.
pub const CREATE_TABLE_ALL: &str = r#"
CREATE OR REPLACE FUNCTION osc_create_table_all(source_table text, new_table text)
RETURNS void LANGUAGE plpgsql AS
$$
BEGIN
  EXECUTE format('CREATE TABLE %s (LIKE %s INCLUDING ALL)', new_table, source_table);
END
$$;
"#;

/// Re-points serial column defaults on the cloned table at fresh sequences
/// owned by the clone, so the shadow table never shares sequence state with
/// the primary table.
pub const FIX_SERIAL_SEQUENCE: &str = r#"
CREATE OR REPLACE FUNCTION osc_fix_serial_sequence(_table regclass, _newtable text)
RETURNS void LANGUAGE plpgsql VOLATILE AS
$func$
DECLARE
  _sql text;
BEGIN
  SELECT INTO _sql
        string_agg('CREATE SEQUENCE ' || seq, E';\n') || E';\n'
     || string_agg(format('ALTER SEQUENCE %s OWNED BY %I.%I', seq, _newtable, a.attname), E';\n') || E';\n'
     || 'ALTER TABLE ' || quote_ident(_newtable) || E'\n  '
     || string_agg(format($$ALTER %I SET DEFAULT nextval('%s'::regclass)$$, a.attname, seq), E'\n, ')
  FROM   pg_attribute a
  JOIN   pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum
       , quote_ident(_newtable || '_' || a.attname || '_seq') AS seq
  WHERE  a.attrelid = _table
  AND    a.attnum > 0
  AND    NOT a.attisdropped
  AND    a.atttypid = ANY ('{int,int8,int2}'::regtype[])
  AND    pg_get_expr(ad.adbin, ad.adrelid) = 'nextval('''
         || (pg_get_serial_sequence(a.attrelid::regclass::text, a.attname))::regclass
         || '''::regclass)';

  IF _sql IS NOT NULL THEN
    EXECUTE _sql;
  END IF;
END
$func$;
"#;
